// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// Failed to open or read a device file or sysfs attribute.
    Io { path: PathBuf, source: io::Error },
    /// A sysfs attribute did not contain the expected number.
    InvalidMapInfo { path: PathBuf, contents: String },
    /// No UIO device with the given name exists.
    NotFound { name: String },
    /// The device has no memory region with the given index.
    NoSuchMap { device: PathBuf, index: usize },
    /// A zero sized mapping was requested.
    EmptyMapping,
    /// The `mmap` call itself failed.
    Mmap(rustix::io::Errno),
}

impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        Self::Mmap(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Error::InvalidMapInfo { path, contents } => {
                write!(f, "{}: invalid map attribute {contents:?}", path.display())
            }
            Error::NotFound { name } => write!(f, "no UIO device named {name:?}"),
            Error::NoSuchMap { device, index } => {
                write!(f, "{} has no memory map {index}", device.display())
            }
            Error::EmptyMapping => write!(f, "cannot map a zero sized region"),
            Error::Mmap(err) => write!(f, "mmap failed: {err}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            Error::Mmap(err) => Some(err),
            _ => None,
        }
    }
}
