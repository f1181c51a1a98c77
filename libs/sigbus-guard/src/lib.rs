// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Recoverable SIGBUS for memory-mapped hardware accesses.
//!
//! Touching a memory-mapped register of a peripheral that is not there (unclocked, held in reset,
//! or simply not part of the loaded bitstream) makes the interconnect answer with a bus error,
//! which Linux delivers as a synchronous SIGBUS. The default disposition of SIGBUS kills the
//! process, so this crate provides [`SigBusGuard`] which turns it into an [`Error::BusError`]
//! instead.
//!
//! The cliff notes:
//! - The whole process blocks SIGBUS up front ([`block_sigbus`]). A thread that faults outside
//!   a guard gets killed exactly like it would without this crate.
//! - [`SigBusGuard::new`] takes a process-wide lock, installs our handler and unblocks SIGBUS
//!   for the calling thread only.
//! - [`SigBusGuard::protect`] takes a checkpoint (see the `arch` module) and publishes it for the
//!   handler, then performs the access.
//! - If the access faults the handler long-jumps back to the checkpoint and `protect` returns an
//!   error carrying the guard's message.
//! - Dropping the guard restores the original handler and signal mask, then releases the lock.
//!
//! The handler slot and the published checkpoint are process global, which is why only one
//! guard can exist at any time.

mod arch;
mod error;

pub use error::Error;

use core::ffi::{c_int, c_void};
use core::fmt::Display;
use core::mem::{self, MaybeUninit};
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use parking_lot::{Mutex, MutexGuard};

/// Serializes all guards across the process.
static GUARD_LOCK: Mutex<()> = Mutex::new(());
/// Checkpoint of the `protect` call currently running, null outside of one.
static CHECKPOINT: AtomicPtr<arch::JmpBuf> = AtomicPtr::new(ptr::null_mut());
/// Thread id of the thread that published `CHECKPOINT`.
static OWNER: AtomicI32 = AtomicI32::new(0);
/// Host address of the last caught fault.
static FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

type SigInfoHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// Blocks SIGBUS for the calling thread.
///
/// This should be the first thing an application using [`SigBusGuard`] does, before spawning
/// any threads, so that every thread inherits the blocked mask.
///
/// # Errors
///
/// Returns [`Error::SignalMaskingFailure`] if the signal mask could not be updated.
pub fn block_sigbus() -> Result<(), Error> {
    // Safety: sigset manipulation on a local set
    let errno = unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGBUS);
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), ptr::null_mut())
    };

    if errno != 0 {
        let err = Error::SignalMaskingFailure { errno };
        tracing::error!("{err}");
        return Err(err);
    }

    Ok(())
}

/// Returns whether SIGBUS is currently blocked on the calling thread.
///
/// # Errors
///
/// Returns [`Error::SignalMaskingFailure`] if the signal mask could not be queried.
pub fn sigbus_blocked() -> Result<bool, Error> {
    let mut mask = MaybeUninit::<libc::sigset_t>::uninit();

    // Safety: passing a null set only queries the current mask
    let errno = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), mask.as_mut_ptr()) };
    if errno != 0 {
        return Err(Error::SignalMaskingFailure { errno });
    }

    // Safety: `pthread_sigmask` succeeded and initialized `mask`
    Ok(unsafe { libc::sigismember(mask.as_ptr(), libc::SIGBUS) } == 1)
}

/// A scope in which SIGBUS raised by the calling thread is recoverable.
///
/// See the [crate-level documentation](crate) for how this works. Guards must not be nested,
/// the process-wide lock is not re-entrant.
pub struct SigBusGuard<M> {
    message: M,
    original_action: libc::sigaction,
    /// `None` until the thread mask has been replaced.
    original_mask: Option<libc::sigset_t>,
    // Dropped last, after the original signal state is back in place.
    _lock: MutexGuard<'static, ()>,
}

impl<M: Display> SigBusGuard<M> {
    /// Enters a guarded scope, `message` is reported if a guarded access faults.
    ///
    /// Blocks until no other thread holds a guard.
    ///
    /// # Errors
    ///
    /// - [`Error::SignalHandlerNotRegistered`] if the SIGBUS handler could not be installed.
    /// - [`Error::SignalMaskingFailure`] if the thread's signal mask could not be updated.
    /// - [`Error::SignalNotBlocked`] if SIGBUS was not blocked on the calling thread.
    ///
    /// Any state that was already changed is restored before the error is returned.
    pub fn new(message: M) -> Result<Self, Error> {
        let lock = GUARD_LOCK.lock();

        tracing::debug!("registering SIGBUS handler");
        // Safety: an all-zero `sigaction` is a valid value (SIG_DFL, empty mask, no flags)
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        // Safety: see above
        let mut original_action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_sigbus as SigInfoHandler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;

        // Safety: both pointers reference valid `sigaction` structs
        let ret = unsafe {
            libc::sigemptyset(&raw mut action.sa_mask);
            libc::sigaction(libc::SIGBUS, &raw const action, &raw mut original_action)
        };
        if ret != 0 {
            let err = Error::SignalHandlerNotRegistered { errno: last_errno() };
            tracing::error!("{err}");
            return Err(err);
        }

        // From here on dropping `guard` puts the original handler back.
        let mut guard = Self {
            message,
            original_action,
            original_mask: None,
            _lock: lock,
        };

        // Block everything we can for the duration of the access, except SIGBUS itself and
        // Ctrl+C.
        let mut masked = MaybeUninit::<libc::sigset_t>::uninit();
        let mut original_mask = MaybeUninit::<libc::sigset_t>::uninit();
        // Safety: sigset manipulation on local sets
        let errno = unsafe {
            libc::sigfillset(masked.as_mut_ptr());
            libc::sigdelset(masked.as_mut_ptr(), libc::SIGKILL);
            libc::sigdelset(masked.as_mut_ptr(), libc::SIGSTOP);
            libc::sigdelset(masked.as_mut_ptr(), libc::SIGINT);
            libc::sigdelset(masked.as_mut_ptr(), libc::SIGBUS);
            libc::pthread_sigmask(
                libc::SIG_SETMASK,
                masked.as_ptr(),
                original_mask.as_mut_ptr(),
            )
        };
        if errno != 0 {
            let err = Error::SignalMaskingFailure { errno };
            tracing::error!("{err}");
            return Err(err);
        }

        // Safety: `pthread_sigmask` succeeded and initialized `original_mask`
        let original_mask = unsafe { original_mask.assume_init() };
        guard.original_mask = Some(original_mask);

        // Safety: `original_mask` is initialized
        if unsafe { libc::sigismember(&raw const original_mask, libc::SIGBUS) } != 1 {
            let err = Error::SignalNotBlocked;
            tracing::error!("{err}");
            return Err(err);
        }

        Ok(guard)
    }

    /// Runs `f`, turning a SIGBUS raised while it runs into [`Error::BusError`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusError`] carrying this guard's message if `f` faulted, and
    /// [`Error::SignalMaskingFailure`] if SIGBUS could not be unblocked again afterwards.
    ///
    /// # Safety
    ///
    /// If `f` faults it is abandoned mid-way without unwinding. `f` must not hold any value
    /// with a destructor at the point where it may fault. A panic in `f` aborts the process.
    pub unsafe fn protect<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce() -> R,
    {
        struct Reset;

        impl Drop for Reset {
            fn drop(&mut self) {
                CHECKPOINT.store(ptr::null_mut(), Ordering::Release);
            }
        }

        let mut ret = None;
        let _reset = Reset;

        let jumped = arch::call_with_setjmp(|checkpoint| {
            OWNER.store(current_thread_id(), Ordering::Relaxed);
            CHECKPOINT.store(ptr::from_ref(checkpoint).cast_mut(), Ordering::Release);
            ret = Some(f());
            CHECKPOINT.store(ptr::null_mut(), Ordering::Release);
        });

        match (jumped, ret) {
            (None, Some(ret)) => Ok(ret),
            _ => {
                let fault_address = FAULT_ADDRESS.load(Ordering::Acquire);
                tracing::debug!(fault_address, "caught SIGBUS: {}", self.message);

                // The handler was left through a jump, so SIGBUS is still blocked from its
                // invocation.
                unblock_sigbus()?;

                Err(Error::BusError {
                    message: self.message.to_string(),
                    fault_address,
                })
            }
        }
    }

    /// The message reported when a guarded access faults.
    pub fn message(&self) -> &M {
        &self.message
    }
}

impl<M> Drop for SigBusGuard<M> {
    fn drop(&mut self) {
        // Safety: restoring the action saved in `new`
        let ret = unsafe {
            libc::sigaction(
                libc::SIGBUS,
                &raw const self.original_action,
                ptr::null_mut(),
            )
        };
        if ret == 0 {
            tracing::debug!("restored original SIGBUS handler");
        } else {
            tracing::error!(
                errno = last_errno(),
                "failed to re-register original SIGBUS handler"
            );
        }

        if let Some(mask) = &self.original_mask {
            // Safety: restoring the mask saved in `new`
            let errno =
                unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask, ptr::null_mut()) };
            if errno != 0 {
                tracing::error!(errno, "failed to restore signal mask");
            }
        }
    }
}

extern "C" fn handle_sigbus(signum: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    if signum != libc::SIGBUS {
        return;
    }

    let checkpoint = claim_checkpoint(current_thread_id());
    if checkpoint.is_null() {
        // Not inside `protect` on this thread. Fall back to the default disposition and return,
        // the faulting instruction runs again and terminates the process.
        // Safety: `signal` is async-signal-safe
        unsafe {
            libc::signal(libc::SIGBUS, libc::SIG_DFL);
        }
        return;
    }

    // Safety: the kernel hands SA_SIGINFO handlers a valid `siginfo_t`
    let fault_address = unsafe { (*info).si_addr() } as usize;
    FAULT_ADDRESS.store(fault_address, Ordering::Release);

    // Safety: `claim_checkpoint` checked that `checkpoint` was published by this thread, so it
    // belongs to the `protect` call further up this very stack. Only the access, the trampoline and this
    // handler are skipped, none of which own anything.
    unsafe { arch::longjmp(checkpoint, NonZeroUsize::MIN) }
}

/// Takes the published checkpoint if it belongs to thread `tid`, null otherwise.
fn claim_checkpoint(tid: libc::pid_t) -> *mut arch::JmpBuf {
    if OWNER.load(Ordering::Relaxed) != tid {
        return ptr::null_mut();
    }
    CHECKPOINT.swap(ptr::null_mut(), Ordering::AcqRel)
}

fn current_thread_id() -> libc::pid_t {
    // Safety: `gettid` has no preconditions and is async-signal-safe
    unsafe { libc::gettid() }
}

fn unblock_sigbus() -> Result<(), Error> {
    // Safety: sigset manipulation on a local set
    let errno = unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGBUS);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_ptr(), ptr::null_mut())
    };

    if errno != 0 {
        let err = Error::SignalMaskingFailure { errno };
        tracing::error!("{err}");
        return Err(err);
    }

    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;
    use std::thread;

    // Some tests inspect the process-wide SIGBUS disposition, which other tests change while
    // they hold a guard.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn current_sigbus_action() -> libc::sighandler_t {
        // Safety: all-zero `sigaction` is valid
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        // Safety: a null `act` only queries the current action
        let ret = unsafe { libc::sigaction(libc::SIGBUS, ptr::null(), &raw mut action) };
        assert_eq!(ret, 0);
        action.sa_sigaction
    }

    #[test]
    fn setjmp_returns_none_without_jump() {
        let mut calls = 0;
        let ret = arch::call_with_setjmp(|_| calls += 1);
        assert_eq!(ret, None);
        assert_eq!(calls, 1);
    }

    #[test]
    fn longjmp_resumes_at_checkpoint() {
        let ret = arch::call_with_setjmp(|buf| {
            // Safety: the checkpoint is live and this closure owns nothing
            unsafe { arch::longjmp(buf, NonZeroUsize::new(1234567).unwrap()) }
        });
        assert_eq!(ret, NonZeroUsize::new(1234567));
    }

    #[test]
    fn longjmp_from_nested_checkpoint() {
        let mut trail = Vec::new();
        let outer = arch::call_with_setjmp(|outer| {
            let inner = arch::call_with_setjmp(|inner| {
                // Safety: the checkpoint is live and this closure owns nothing
                unsafe { arch::longjmp(inner, NonZeroUsize::new(2).unwrap()) }
            });
            trail.push(inner);
            // Safety: the checkpoint is live and this closure owns nothing
            unsafe { arch::longjmp(outer, NonZeroUsize::new(1).unwrap()) }
        });
        trail.push(outer);
        assert_eq!(trail, [NonZeroUsize::new(2), NonZeroUsize::new(1)]);
    }

    #[test_log::test]
    fn catches_sigbus() {
        let _serial = SERIAL.lock();
        block_sigbus().unwrap();

        let guard = SigBusGuard::new(format!("Reg: 0x{:08X}", 0x1234)).unwrap();
        // Safety: the closure owns nothing
        let err = unsafe {
            guard.protect(|| {
                libc::raise(libc::SIGBUS);
            })
        }
        .unwrap_err();

        match err {
            Error::BusError { message, .. } => assert_eq!(message, "Reg: 0x00001234"),
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[test_log::test]
    fn returns_value_without_fault() {
        let _serial = SERIAL.lock();
        block_sigbus().unwrap();

        let word = 0xCAFE_BABE_u32;
        let guard = SigBusGuard::new("Reg: 0x00000000").unwrap();
        // Safety: reading a local
        let value = unsafe { guard.protect(|| ptr::read_volatile(&raw const word)) };
        assert_eq!(value, Ok(0xCAFE_BABE));
    }

    #[test_log::test]
    fn restores_signal_state() {
        let _serial = SERIAL.lock();
        block_sigbus().unwrap();
        let before = current_sigbus_action();

        {
            let guard = SigBusGuard::new("restore").unwrap();
            assert!(!sigbus_blocked().unwrap());
            assert_ne!(current_sigbus_action(), before);
            // Safety: the closure owns nothing
            let res = unsafe {
                guard.protect(|| {
                    libc::raise(libc::SIGBUS);
                })
            };
            assert!(res.is_err());
        }

        assert!(sigbus_blocked().unwrap());
        assert_eq!(current_sigbus_action(), before);

        // and the machinery still works afterwards
        let guard = SigBusGuard::new("again").unwrap();
        // Safety: the closure owns nothing
        assert_eq!(unsafe { guard.protect(|| 42) }, Ok(42));
    }

    #[test_log::test]
    fn requires_sigbus_blocked() {
        let _serial = SERIAL.lock();
        thread::spawn(|| {
            // Safety: sigset manipulation on a local set
            unsafe {
                let mut set = MaybeUninit::<libc::sigset_t>::uninit();
                libc::sigemptyset(set.as_mut_ptr());
                libc::sigaddset(set.as_mut_ptr(), libc::SIGBUS);
                assert_eq!(
                    libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_ptr(), ptr::null_mut()),
                    0
                );
            }
            let before = current_sigbus_action();

            let err = SigBusGuard::new("unblocked").err();
            assert_eq!(err, Some(Error::SignalNotBlocked));
            assert!(err.unwrap().is_setup_failure());

            assert_eq!(current_sigbus_action(), before);
            assert!(!sigbus_blocked().unwrap());
        })
        .join()
        .unwrap();
    }

    /// Maps one page of a file and truncates the file, every access to the page raises SIGBUS.
    struct Truncated {
        _file: std::fs::File,
        ptr: *mut u32,
        len: usize,
    }

    impl Truncated {
        fn new() -> Self {
            // Safety: `sysconf` has no preconditions
            let len = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap();
            let file = tempfile::tempfile().unwrap();
            file.set_len(len as u64).unwrap();

            // Safety: fresh shared mapping of a file we own
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    std::os::fd::AsRawFd::as_raw_fd(&file),
                    0,
                )
            };
            assert_ne!(ptr, libc::MAP_FAILED);
            file.set_len(0).unwrap();

            Self {
                _file: file,
                ptr: ptr.cast(),
                len,
            }
        }
    }

    impl Drop for Truncated {
        fn drop(&mut self) {
            // Safety: unmapping the region mapped in `new`
            unsafe {
                libc::munmap(self.ptr.cast(), self.len);
            }
        }
    }

    #[test_log::test]
    fn faults_twice_under_one_guard() {
        let _serial = SERIAL.lock();
        block_sigbus().unwrap();
        let region = Truncated::new();
        let ptr = region.ptr;

        let guard = SigBusGuard::new("Reg: 0x00000000").unwrap();
        for _ in 0..3 {
            // Safety: the closure owns nothing
            let res = unsafe { guard.protect(|| ptr.read_volatile()) };
            assert!(matches!(res, Err(Error::BusError { .. })), "{res:?}");
            assert!(!sigbus_blocked().unwrap());
        }
        // Safety: the closure owns nothing
        let res = unsafe { guard.protect(|| ptr.add(1).write_volatile(1)) };
        assert!(matches!(res, Err(Error::BusError { .. })), "{res:?}");
        drop(guard);

        assert!(sigbus_blocked().unwrap());
    }

    #[test]
    fn checkpoint_belongs_to_publishing_thread() {
        // keeps real guards from publishing in the meantime
        let _lock = GUARD_LOCK.lock();
        let mut buf = arch::JmpBuf::new();
        let checkpoint = ptr::from_mut(&mut buf);
        let tid = current_thread_id();

        OWNER.store(tid, Ordering::Relaxed);
        CHECKPOINT.store(checkpoint, Ordering::Release);

        assert!(claim_checkpoint(tid + 1).is_null());
        assert_eq!(CHECKPOINT.load(Ordering::Acquire), checkpoint);

        assert_eq!(claim_checkpoint(tid), checkpoint);
        assert!(CHECKPOINT.load(Ordering::Acquire).is_null());
        assert!(claim_checkpoint(tid).is_null());
    }

    #[test]
    fn guarded_regions_never_overlap() {
        let _serial = SERIAL.lock();
        static INSIDE: AtomicUsize = AtomicUsize::new(0);
        static OVERLAPPED: AtomicBool = AtomicBool::new(false);

        block_sigbus().unwrap();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    for _ in 0..200 {
                        let guard = SigBusGuard::new(i).unwrap();
                        // Safety: the closure owns nothing
                        unsafe {
                            guard
                                .protect(|| {
                                    if INSIDE.fetch_add(1, Ordering::SeqCst) != 0 {
                                        OVERLAPPED.store(true, Ordering::SeqCst);
                                    }
                                    for _ in 0..100 {
                                        core::hint::spin_loop();
                                    }
                                    INSIDE.fetch_sub(1, Ordering::SeqCst);
                                })
                                .unwrap();
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert!(!OVERLAPPED.load(Ordering::SeqCst));
    }
}
