// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw memory access: peek and poke.
//!
//! There is no address validation here on purpose; unrestricted access is
//! the feature. Two strategies exist and are chosen once, at compile time,
//! never mixed within a reply:
//!
//! - default: a direct copy through the requested pointer. A bad address
//!   faults the worker, which is the documented cost; the listener keeps
//!   accepting.
//! - `safe-copy` (Linux): `process_vm_readv`/`process_vm_writev` aimed at
//!   our own pid, so the kernel does the touching and a bad address comes
//!   back as an error reply instead of a corpse.

use waldo_proto::messages::{ReplyPeek, ReplyPoke, RequestPeek, RequestPoke};
use waldo_proto::Wire;

use crate::dispatch::RoutineResult;
use crate::worker::Worker;

pub(crate) fn peek(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestPeek::from_bytes(body)?;
    let data = read_memory(request.address, request.size as usize)?;
    Ok(ReplyPeek { data }.to_bytes())
}

pub(crate) fn poke(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestPoke::from_bytes(body)?;
    write_memory(request.address, &request.data)?;
    Ok(ReplyPoke.to_bytes())
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "safe-copy", target_os = "linux"))] {
        use std::io::{IoSlice, IoSliceMut};

        use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
        use nix::unistd::Pid;

        use crate::dispatch::RoutineError;

        fn read_memory(address: u64, size: usize) -> Result<Vec<u8>, RoutineError> {
            let mut buf = vec![0u8; size];
            if size == 0 {
                return Ok(buf);
            }
            let mut local = [IoSliceMut::new(&mut buf)];
            let remote = [RemoteIoVec { base: address as usize, len: size }];
            let copied = process_vm_readv(Pid::this(), &mut local, &remote)
                .map_err(|_| RoutineError::Protocol)?;
            if copied != size {
                return Err(RoutineError::Protocol);
            }
            Ok(buf)
        }

        fn write_memory(address: u64, data: &[u8]) -> Result<(), RoutineError> {
            if data.is_empty() {
                return Ok(());
            }
            let local = [IoSlice::new(data)];
            let remote = [RemoteIoVec { base: address as usize, len: data.len() }];
            let copied = process_vm_writev(Pid::this(), &local, &remote)
                .map_err(|_| RoutineError::Protocol)?;
            if copied != data.len() {
                return Err(RoutineError::Protocol);
            }
            Ok(())
        }
    } else {
        use crate::dispatch::RoutineError;

        fn read_memory(address: u64, size: usize) -> Result<Vec<u8>, RoutineError> {
            let mut buf = vec![0u8; size];
            if size > 0 {
                // Best effort; an invalid address faults here.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        address as usize as *const u8,
                        buf.as_mut_ptr(),
                        size,
                    );
                }
            }
            Ok(buf)
        }

        fn write_memory(address: u64, data: &[u8]) -> Result<(), RoutineError> {
            if !data.is_empty() {
                // Best effort; an invalid address faults here.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        address as usize as *mut u8,
                        data.len(),
                    );
                }
            }
            Ok(())
        }
    }
}
