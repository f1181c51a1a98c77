// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// `sigaction` refused to install the SIGBUS handler.
    SignalHandlerNotRegistered { errno: i32 },
    /// `pthread_sigmask` failed to update the calling thread's signal mask.
    SignalMaskingFailure { errno: i32 },
    /// SIGBUS was not blocked on the calling thread when the guard was created.
    ///
    /// Every thread has to block SIGBUS (see [`block_sigbus`](crate::block_sigbus)) before any
    /// guard is used, otherwise a fault on an unguarded thread could end up in our handler.
    SignalNotBlocked,
    /// A SIGBUS was caught inside a guarded region.
    BusError {
        /// The message the guard was created with.
        message: String,
        /// The host address reported by the kernel, if any.
        fault_address: usize,
    },
}

impl Error {
    /// Returns `true` for errors caused by a misconfigured process rather than by a single
    /// faulting access.
    pub fn is_setup_failure(&self) -> bool {
        !matches!(self, Error::BusError { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::SignalHandlerNotRegistered { errno } => write!(
                f,
                "Failed to register SIGBUS handler; errno={errno}, meaning \"{}\"",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Error::SignalMaskingFailure { errno } => write!(
                f,
                "Failed to update signal mask; errno={errno}, meaning \"{}\"",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Error::SignalNotBlocked => {
                write!(f, "SIGBUS must be blocked (by all threads) before using SigBusGuard")
            }
            Error::BusError {
                message,
                fault_address,
            } => write!(f, "SIGBUS received ({message}); fault address {fault_address:#x}"),
        }
    }
}

impl core::error::Error for Error {}
