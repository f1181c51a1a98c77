// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};
use core::ops::Range;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// The address lies outside the window of the device owning it. Detected before any
    /// hardware is touched.
    OutOfRange {
        address: u32,
        /// Window `base..base + size` of the closest device, `None` if no device starts at or
        /// below `address`.
        window: Option<Range<u64>>,
    },
    /// The hardware answered the access with a bus error.
    AccessFault { address: u32, message: String },
    /// The fault recovery machinery could not be set up. This means the process is
    /// misconfigured (usually SIGBUS not blocked) and is not specific to one access.
    Guard(sigbus_guard::Error),
    /// The operation is not supported by this backend.
    Unimplemented { function: &'static str },
    /// A value was read before the dispatch that validates it.
    NotValidated,
    /// A device must cover at least one word.
    EmptyDevice { base: u32 },
    /// A device claims more words than its mapping provides.
    MappingTooSmall { base: u32, size: u32, mapped: usize },
    /// The registers of a device don't start at a word boundary.
    MisalignedMapping { base: u32 },
    /// Opening or mapping a UIO device failed.
    Uio(uio::Error),
    /// The device configuration could not be read or is invalid.
    Config { path: PathBuf, message: String },
}

impl From<sigbus_guard::Error> for Error {
    fn from(err: sigbus_guard::Error) -> Self {
        Self::Guard(err)
    }
}

impl From<uio::Error> for Error {
    fn from(err: uio::Error) -> Self {
        Self::Uio(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfRange {
                address,
                window: Some(window),
            } => write!(
                f,
                "Address ({address:#010x}) out of mapped range: {:#010x} to {:#010x}",
                window.start, window.end
            ),
            Error::OutOfRange {
                address,
                window: None,
            } => write!(f, "Address ({address:#010x}) is not mapped by any device"),
            Error::AccessFault { address, message } => {
                write!(f, "Bus error accessing {address:#010x} ({message})")
            }
            Error::Guard(err) => write!(f, "SIGBUS protection failed: {err}"),
            Error::Unimplemented { function } => {
                write!(f, "Function {function}() is not yet implemented")
            }
            Error::NotValidated => write!(f, "Value has not been validated by a dispatch"),
            Error::EmptyDevice { base } => write!(f, "Device at {base:#010x} has no words"),
            Error::MappingTooSmall { base, size, mapped } => write!(
                f,
                "Device at {base:#010x} claims {size} words but only {mapped} bytes are mapped"
            ),
            Error::MisalignedMapping { base } => {
                write!(f, "Device at {base:#010x} is not mapped at a word boundary")
            }
            Error::Uio(err) => write!(f, "{err}"),
            Error::Config { path, message } => write!(f, "{}: {message}", path.display()),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Guard(err) => Some(err),
            Error::Uio(err) => Some(err),
            _ => None,
        }
    }
}
