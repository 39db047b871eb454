// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic-loader routines: dlopen, dlclose, dlsym.
//!
//! These return raw loader results rather than editorializing: a null
//! handle or symbol is a perfectly good answer, and the client knows what
//! zero means. The daemon does not track handles; their lifetime is the
//! client's business until the worker exits.

use std::ffi::CString;

use log::debug;

use waldo_proto::messages::{
    ReplyDlclose, ReplyDlopen, ReplyDlsym, RequestDlclose, RequestDlopen,
    RequestDlsym,
};
use waldo_proto::Wire;

use crate::dispatch::{RoutineError, RoutineResult};
use crate::worker::Worker;

pub(crate) fn dlopen(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestDlopen::from_bytes(body)?;
    // An empty filename selects the main program, the same handle dlopen
    // hands out for a null pathname.
    let handle = if request.filename.is_empty() {
        unsafe { libc::dlopen(std::ptr::null(), request.mode as libc::c_int) }
    } else {
        let filename = CString::new(request.filename)
            .map_err(|_| RoutineError::Protocol)?;
        unsafe { libc::dlopen(filename.as_ptr(), request.mode as libc::c_int) }
    };
    Ok(ReplyDlopen {
        handle: handle as u64,
    }
    .to_bytes())
}

pub(crate) fn dlclose(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestDlclose::from_bytes(body)?;
    let res =
        unsafe { libc::dlclose(request.handle as *mut libc::c_void) } as u64;
    Ok(ReplyDlclose { res }.to_bytes())
}

pub(crate) fn dlsym(_worker: &mut Worker, body: &[u8]) -> RoutineResult {
    let request = RequestDlsym::from_bytes(body)?;
    let symbol = CString::new(request.symbol_name.as_str())
        .map_err(|_| RoutineError::Protocol)?;
    let ptr = unsafe {
        libc::dlsym(request.handle as *mut libc::c_void, symbol.as_ptr())
    } as u64;
    debug!("{} = {:#x}", request.symbol_name, ptr);
    Ok(ReplyDlsym { ptr }.to_bytes())
}
