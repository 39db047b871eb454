// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fallback engine for 64-bit targets without a trampoline.
//!
//! The target is invoked through a function pointer taking [`MAX_ARGS`]
//! integer arguments; the platform ABI spills whatever does not fit in
//! registers, which matches what a callee taking fewer arguments expects.
//! Doubles are delivered bit-cast in integer slots, so callees expecting
//! FPR-passed doubles are out of reach here; the AArch64 engine is the one
//! that does this properly.

use crate::{CallError, Operand, MAX_ARGS};

type CallMax = unsafe extern "C" fn(
    u64, u64, u64, u64, u64, u64, u64, u64, u64,
    u64, u64, u64, u64, u64, u64, u64, u64,
) -> u64;

static_assertions::const_assert_eq!(MAX_ARGS, 17);

pub(crate) fn flatten(slots: &[Operand]) -> Result<[u64; MAX_ARGS], CallError> {
    if slots.len() > MAX_ARGS {
        return Err(CallError::TooManyArguments {
            argc: slots.len(),
            max: MAX_ARGS,
        });
    }
    let mut flat = [0u64; MAX_ARGS];
    for (slot, op) in flat.iter_mut().zip(slots) {
        *slot = op.bits;
    }
    Ok(flat)
}

/// # Safety
///
/// `target` must be the address of callable code following the platform's C
/// convention, tolerant of the surplus zero arguments this call delivers.
/// Pointer arguments must be valid for the callee's use of them.
pub(crate) unsafe fn invoke(target: u64, a: &[u64; MAX_ARGS]) -> u64 {
    let f: CallMax = core::mem::transmute(target as usize);
    f(
        a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
        a[11], a[12], a[13], a[14], a[15], a[16],
    )
}
