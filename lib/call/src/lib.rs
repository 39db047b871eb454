// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamically-typed C function calls.
//!
//! [`call`] takes a target address, a variadic boundary, and a vector of
//! [`Argument`]s, and performs a native C call. Two engines exist, selected
//! at build time:
//!
//! - **AArch64**: a layout phase places each argument in `x0..x7`, `d0..d7`,
//!   or one of sixteen stack slots, honoring the variadic boundary (AAPCS64
//!   passes the variadic portion on the stack, so an argument at or past
//!   `va_list_index` must never ride in a register, even if registers are
//!   free). A `global_asm!` trampoline then loads the register file, copies
//!   the stack slots, and branches to the target. The reply is the full
//!   `x0..x7`/`d0..d7` bank; the client decides which registers it cares
//!   about.
//!
//! - **Generic 64-bit**: the arguments are flattened into [`MAX_ARGS`]
//!   `u64` slots and the target is invoked through a [`MAX_ARGS`]-ary
//!   `extern "C"` function pointer; the platform's own calling convention
//!   handles register/stack split. Doubles travel bit-cast in integer slots,
//!   so this engine cannot feed FPR-passed doubles; the reply is the scalar
//!   return only.
//!
//! Address materialization happens *here*, not in the routine layer:
//! `Str` arguments become owned NUL-terminated buffers and `Bytes` borrow
//! the decoded request, both guaranteed to outlive the indirect call. The
//! engine never inspects the callee; `va_list_index` is the caller's
//! contract to get right.

use std::ffi::CString;
use std::fmt;

use waldo_proto::messages::{Argument, CallReturn};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;

        fn engine_call(
            address: u64,
            va_list_index: u64,
            ops: &Operands,
        ) -> Result<CallReturn, CallError> {
            let args = layout(&ops.slots, va_list_index)?;
            let regs = unsafe { aarch64::invoke(address, &args) };
            Ok(CallReturn::ArmRegisters(regs))
        }
    } else {
        mod generic;

        fn engine_call(
            address: u64,
            _va_list_index: u64,
            ops: &Operands,
        ) -> Result<CallReturn, CallError> {
            let flat = generic::flatten(&ops.slots)?;
            let ret = unsafe { generic::invoke(address, &flat) };
            Ok(CallReturn::Value(ret))
        }
    }
}

/// Integer and double register file depth on AArch64.
pub const MAX_REG_ARGS: usize = 8;

/// Stack slots reserved by the AArch64 trampoline.
pub const MAX_STACK_ARGS: usize = 16;

/// Argument slots of the generic engine's flattened call.
pub const MAX_ARGS: usize = 17;

/// Ways a call request can be unexecutable. All of these are caller
/// mistakes, detected before anything is invoked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallError {
    /// `va_list_index` pointed past the end of the argument vector.
    BadVaListIndex { va_list_index: u64, argc: usize },
    /// More arguments than the generic engine's flattened call can carry.
    TooManyArguments { argc: usize, max: usize },
    /// More stack-bound arguments than the trampoline's reserved frame.
    StackExhausted { max: usize },
    /// A string argument contained an interior NUL and cannot be handed to
    /// C as a NUL-terminated buffer.
    NulInString,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadVaListIndex { va_list_index, argc } => write!(
                f,
                "va_list index {va_list_index} exceeds argument count {argc}"
            ),
            Self::TooManyArguments { argc, max } => {
                write!(f, "{argc} arguments exceed the supported {max}")
            }
            Self::StackExhausted { max } => {
                write!(f, "more than {max} stack-bound arguments")
            }
            Self::NulInString => write!(f, "string argument contains NUL"),
        }
    }
}

impl std::error::Error for CallError {}

/// One argument reduced to what the ABI cares about: which register file it
/// wants, and the 64 bits that go there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operand {
    pub fp: bool,
    pub bits: u64,
}

/// The AArch64 pre-call layout: everything the trampoline loads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ArmArgs {
    pub x: [u64; MAX_REG_ARGS],
    pub d: [u64; MAX_REG_ARGS],
    pub stack: [u64; MAX_STACK_ARGS],
}

// The trampoline addresses these fields by byte offset.
static_assertions::const_assert_eq!(core::mem::size_of::<ArmArgs>(), 256);

/// Operands plus the owned buffers backing their pointer values. Must stay
/// alive until the call returns; dropping it invalidates any `Str`
/// addresses already laid out.
struct Operands {
    slots: Vec<Operand>,
    _strings: Vec<CString>,
}

fn materialize(argv: &[Argument]) -> Result<Operands, CallError> {
    let mut slots = Vec::with_capacity(argv.len());
    let mut strings = Vec::new();
    for arg in argv {
        match arg {
            Argument::Int(v) => slots.push(Operand {
                fp: false,
                bits: *v,
            }),
            Argument::Double(v) => slots.push(Operand {
                fp: true,
                bits: v.to_bits(),
            }),
            Argument::Str(s) => {
                let c = CString::new(s.as_str())
                    .map_err(|_| CallError::NulInString)?;
                slots.push(Operand {
                    fp: false,
                    bits: c.as_ptr() as u64,
                });
                // Moving the CString moves the handle, not the heap buffer;
                // the pointer recorded above stays good.
                strings.push(c);
            }
            Argument::Bytes(b) => slots.push(Operand {
                fp: false,
                bits: b.as_ptr() as u64,
            }),
        }
    }
    Ok(Operands {
        slots,
        _strings: strings,
    })
}

/// Places operands into the AArch64 register files and stack slots.
///
/// Walks the vector in order with one cursor per target area. An operand
/// goes to the stack when its index is at or past the variadic boundary, or
/// when its register file has run dry; otherwise it claims the next
/// register of its class. This is target-independent bookkeeping and is
/// unit-tested on every host, not just AArch64.
pub fn layout(slots: &[Operand], va_list_index: u64) -> Result<ArmArgs, CallError> {
    let mut args = ArmArgs::default();
    let mut gp = 0;
    let mut fp = 0;
    let mut sp = 0;
    for (i, op) in slots.iter().enumerate() {
        let variadic = i as u64 >= va_list_index;
        if !variadic && op.fp && fp < MAX_REG_ARGS {
            args.d[fp] = op.bits;
            fp += 1;
        } else if !variadic && !op.fp && gp < MAX_REG_ARGS {
            args.x[gp] = op.bits;
            gp += 1;
        } else {
            if sp == MAX_STACK_ARGS {
                return Err(CallError::StackExhausted {
                    max: MAX_STACK_ARGS,
                });
            }
            args.stack[sp] = op.bits;
            sp += 1;
        }
    }
    Ok(args)
}

/// Performs the call. See the module docs for what each target's engine
/// produces; the common parts are argument validation and materialization.
///
/// This is safe to *compile* and wildly unsafe to *use* with a bad address;
/// that is the entire point of the daemon, so the unsafety lives behind the
/// routine's contract with the client rather than this signature.
pub fn call(
    address: u64,
    va_list_index: u64,
    argv: &[Argument],
) -> Result<CallReturn, CallError> {
    if va_list_index > argv.len() as u64 {
        return Err(CallError::BadVaListIndex {
            va_list_index,
            argc: argv.len(),
        });
    }
    let ops = materialize(argv)?;
    // `ops` owns the string buffers; it lives on this frame until the
    // engine returns, so every address laid out below stays valid.
    engine_call(address, va_list_index, &ops)
}
