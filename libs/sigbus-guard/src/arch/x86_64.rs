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

/// Registers that survive a jump. RBX and RBP are LLVM reserved and can't be declared as
/// clobbers, everything else callee-saved is.
#[repr(C)]
#[derive(Debug)]
pub struct JmpBuf {
    rip: usize,
    rsp: usize,
    rbp: usize,
    rbx: usize,
}

impl JmpBuf {
    pub const fn new() -> Self {
        Self {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rbx: 0,
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
            // Record where to resume and the reserved registers needed to get there.
            "lea rax, [rip + 2f]",
            "mov [rdi], rax",
            "mov [rdi + 8], rsp",
            "mov [rdi + 16], rbp",
            "mov [rdi + 24], rbx",
            // The stack is ABI aligned on entry to the asm block, so this is a regular call.
            "call {trampoline}",
            // Both a normal return from the trampoline and a `longjmp` end up here with the
            // result in RAX.
            "2:",
            trampoline = sym trampoline::<F>,
            inlateout("rdi") ptr::from_mut(buf) => _,
            inlateout("rsi") ptr::from_mut(f) => _,
            lateout("rax") ret,
            // See the comment in `JmpBuf`; the remaining callee-saved registers are marked
            // clobbered here and by `clobber_abi`.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
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
            "mov rsp, [rdi + 8]",
            "mov rbp, [rdi + 16]",
            "mov rbx, [rdi + 24]",
            "jmp qword ptr [rdi]",
            in("rdi") buf,
            in("rax") val.get(),
            options(noreturn)
        }
    }
}
