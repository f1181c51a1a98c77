// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Minimal setjmp/longjmp.
//!
//! Rust has no sound way of calling the libc `sigsetjmp` (it returns twice), so instead the
//! checkpoint is taken inside an `asm!` block that saves the few registers LLVM won't let us mark
//! as clobbered (stack pointer, frame pointer and friends) and then *calls* the protected closure
//! through a trampoline. Every other register is declared clobbered, so when [`longjmp`] lands on
//! the resume label the compiler already expects their contents to be garbage.
//!
//! Jumping skips every frame between the checkpoint and the jump, without running destructors.
//! Callers must make sure only plain frames (the trampoline, the access itself and the signal
//! handler) are skipped.

use core::num::NonZeroUsize;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

/// Entered from the `asm!` block of `call_with_setjmp` with a pointer to the checkpoint and a
/// pointer to the (not yet moved) closure.
///
/// Returns 0 so the resume label can tell a normal return apart from a jump. A panic in `f`
/// can't unwind through the `asm!` block and aborts the process here.
unsafe extern "C" fn trampoline<F>(buf: *const JmpBuf, f: *mut F) -> usize
where
    F: FnOnce(&JmpBuf),
{
    // Safety: `call_with_setjmp` hands us a pointer to a `ManuallyDrop<F>` it never touches
    // again, and a pointer to a checkpoint living in its own stack frame.
    unsafe {
        let f = f.read();
        f(&*buf);
    }
    0
}

/// Takes a checkpoint and calls `f` with it.
///
/// Returns `None` when `f` returned normally and `Some(val)` when [`longjmp`] was called on the
/// checkpoint with `val`.
pub fn call_with_setjmp<F>(f: F) -> Option<NonZeroUsize>
where
    F: FnOnce(&JmpBuf),
{
    let mut buf = JmpBuf::new();
    let mut f = core::mem::ManuallyDrop::new(f);

    // Safety: see the per-architecture implementations
    let ret = unsafe { setjmp_and_call(&mut buf, &mut *f) };

    NonZeroUsize::new(ret)
}
