// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::trampoline;
use core::arch::asm;
use core::num::NonZeroUsize;
use core::ptr;

/// X19 and the frame pointer are LLVM reserved and can't be declared as clobbers.
#[repr(C)]
#[derive(Debug)]
pub struct JmpBuf {
    pc: usize,
    sp: usize,
    x19: usize,
    fp: usize,
}

impl JmpBuf {
    pub const fn new() -> Self {
        Self {
            pc: 0,
            sp: 0,
            x19: 0,
            fp: 0,
        }
    }
}

/// # Safety
///
/// `f` must point to a closure that is not used again by the caller, it is moved out of by the
/// trampoline.
#[inline(never)]
pub unsafe fn setjmp_and_call<F>(buf: &mut JmpBuf, f: &mut F) -> usize
where
    F: FnOnce(&JmpBuf),
{
    let ret: usize;

    // Safety: inline assembly
    unsafe {
        asm! {
            "adr x9, 2f",
            "mov x10, sp",
            "stp x9, x10, [x0]",
            "stp x19, x29, [x0, #16]",
            "bl {trampoline}",
            // The result is in X0 for both a normal return and a `longjmp`.
            "2:",
            trampoline = sym trampoline::<F>,
            inlateout("x0") ptr::from_mut(buf) => ret,
            inlateout("x1") ptr::from_mut(f) => _,
            // Callee-saved registers not covered by `clobber_abi`. The full V registers are
            // already part of it.
            lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
            lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
            lateout("x28") _,
            clobber_abi("C"),
        }
    }

    ret
}

/// Resumes execution at the checkpoint `buf`, making `call_with_setjmp` return `Some(val)`.
///
/// # Safety
///
/// `buf` must be a checkpoint whose `call_with_setjmp` is still on the stack of the calling
/// thread, and no frame between the two may need to be dropped.
pub unsafe fn longjmp(buf: *const JmpBuf, val: NonZeroUsize) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "ldp x9, x10, [x0]",
            "ldp x19, x29, [x0, #16]",
            "mov sp, x10",
            "mov x0, x1",
            "br x9",
            in("x0") buf,
            in("x1") val.get(),
            options(noreturn)
        }
    }
}
