// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Just enough of the Linux userspace I/O (UIO) interface to get at the memory of a device.
//!
//! A UIO device shows up as `/dev/uioN` together with a sysfs directory
//! `/sys/class/uio/uioN` describing its name and memory regions (`maps/mapM/{addr,size,offset}`).
//! Region `M` is mapped by calling `mmap` on the device file with an offset of `M` pages.
//!
//! Interrupt handling and device (re)configuration are out of scope.

mod device;
mod error;
mod mmap;

pub use device::{DEFAULT_SYSFS_ROOT, MapInfo, UioDevice};
pub use error::Error;
pub use mmap::Mapping;

pub type Result<T> = core::result::Result<T, Error>;

/// Returns the host page size in bytes.
pub fn host_page_size() -> usize {
    rustix::param::page_size()
}
