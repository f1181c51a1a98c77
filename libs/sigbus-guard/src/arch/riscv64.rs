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

/// S0 (the frame pointer) and S1 are LLVM reserved and can't be declared as clobbers.
#[repr(C)]
#[derive(Debug)]
pub struct JmpBuf {
    pc: usize,
    sp: usize,
    s0: usize,
    s1: usize,
}

impl JmpBuf {
    pub const fn new() -> Self {
        Self {
            pc: 0,
            sp: 0,
            s0: 0,
            s1: 0,
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
        cfg_if::cfg_if! {
            if #[cfg(target_feature = "d")] {
                asm! {
                    "lla t0, 2f",
                    "sd t0, 0(a0)",
                    "sd sp, 8(a0)",
                    "sd s0, 16(a0)",
                    "sd s1, 24(a0)",
                    "call {trampoline}",
                    "2:",
                    trampoline = sym trampoline::<F>,
                    inlateout("a0") ptr::from_mut(buf) => ret,
                    inlateout("a1") ptr::from_mut(f) => _,
                    lateout("s2") _, lateout("s3") _, lateout("s4") _, lateout("s5") _,
                    lateout("s6") _, lateout("s7") _, lateout("s8") _, lateout("s9") _,
                    lateout("s10") _, lateout("s11") _,
                    lateout("fs0") _, lateout("fs1") _, lateout("fs2") _, lateout("fs3") _,
                    lateout("fs4") _, lateout("fs5") _, lateout("fs6") _, lateout("fs7") _,
                    lateout("fs8") _, lateout("fs9") _, lateout("fs10") _, lateout("fs11") _,
                    clobber_abi("C"),
                }
            } else {
                asm! {
                    "lla t0, 2f",
                    "sd t0, 0(a0)",
                    "sd sp, 8(a0)",
                    "sd s0, 16(a0)",
                    "sd s1, 24(a0)",
                    "call {trampoline}",
                    "2:",
                    trampoline = sym trampoline::<F>,
                    inlateout("a0") ptr::from_mut(buf) => ret,
                    inlateout("a1") ptr::from_mut(f) => _,
                    lateout("s2") _, lateout("s3") _, lateout("s4") _, lateout("s5") _,
                    lateout("s6") _, lateout("s7") _, lateout("s8") _, lateout("s9") _,
                    lateout("s10") _, lateout("s11") _,
                    clobber_abi("C"),
                }
            }
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
            "ld t0, 0(a0)",
            "ld sp, 8(a0)",
            "ld s0, 16(a0)",
            "ld s1, 24(a0)",
            "mv a0, a1",
            "jr t0",
            in("a0") buf,
            in("a1") val.get(),
            options(noreturn)
        }
    }
}
