// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The AArch64 trampoline.
//!
//! There is no portable substitute for this: loading a specific register
//! image and branching to an arbitrary address is below the level any
//! calling-convention library exposes once a variadic boundary is involved.
//! The assembly is kept to a single leaf routine with an `extern "C"`
//! signature; everything above it is ordinary Rust.

use core::arch::global_asm;

use waldo_proto::messages::ArmRegisters;

use crate::{ArmArgs, MAX_STACK_ARGS};

/// Register bank as the trampoline writes it. `#[repr(C)]` because the
/// assembly stores by byte offset: `x` at 0, `d` at 64.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RegBank {
    x: [u64; 8],
    d: [u64; 8],
}

static_assertions::const_assert_eq!(core::mem::size_of::<RegBank>(), 128);
static_assertions::const_assert_eq!(MAX_STACK_ARGS * 8, 128);

// Frame discipline: x29/x30 and the callee-saved temporaries we need
// (x19..x21) go in a 48-byte frame, then exactly 128 bytes are reserved for
// the sixteen outgoing stack slots. The reservation is released before the
// epilogue touches anything, so sp is never off-frame. Offsets into the
// argument block are the ArmArgs field offsets: x at 0, d at 64, stack at
// 128.
global_asm!(
    r#"
    .text
    .balign 4
    .global waldo_call_trampoline
waldo_call_trampoline:
    stp x29, x30, [sp, #-48]!
    mov x29, sp
    stp x19, x20, [sp, #16]
    str x21, [sp, #32]

    mov x19, x0                     // argument block
    mov x20, x1                     // result bank
    mov x21, x2                     // call target

    sub sp, sp, #128

    add x9, x19, #128               // outgoing stack slots
    mov x10, #0
1:
    ldr x11, [x9, x10, lsl #3]
    str x11, [sp, x10, lsl #3]
    add x10, x10, #1
    cmp x10, #16
    b.ne 1b

    ldp x0, x1, [x19]
    ldp x2, x3, [x19, #16]
    ldp x4, x5, [x19, #32]
    ldp x6, x7, [x19, #48]
    ldp d0, d1, [x19, #64]
    ldp d2, d3, [x19, #80]
    ldp d4, d5, [x19, #96]
    ldp d6, d7, [x19, #112]

    blr x21

    stp x0, x1, [x20]
    stp x2, x3, [x20, #16]
    stp x4, x5, [x20, #32]
    stp x6, x7, [x20, #48]
    stp d0, d1, [x20, #64]
    stp d2, d3, [x20, #80]
    stp d4, d5, [x20, #96]
    stp d6, d7, [x20, #112]

    add sp, sp, #128
    ldr x21, [sp, #32]
    ldp x19, x20, [sp, #16]
    ldp x29, x30, [sp], #48
    ret
"#
);

extern "C" {
    fn waldo_call_trampoline(args: *const ArmArgs, out: *mut RegBank, target: u64);
}

/// Branches to `target` with the given register and stack image and returns
/// the post-call register bank.
///
/// # Safety
///
/// `target` must be the address of callable code following the AAPCS64,
/// expecting at most the argument image described by `args`. Any pointer
/// values inside `args` must be valid for whatever the callee does with
/// them. A wild `target` takes the process with it; that is the documented
/// cost of unrestricted access.
pub(crate) unsafe fn invoke(target: u64, args: &ArmArgs) -> ArmRegisters {
    let mut bank = RegBank::default();
    waldo_call_trampoline(args, &mut bank, target);
    ArmRegisters {
        x: bank.x,
        d: bank.d,
    }
}
