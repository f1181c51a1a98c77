// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Register access to memory-mapped AXI peripherals through Linux UIO.
//!
//! Peripherals are addressed through a single flat, word-addressed 32-bit space. A [`DeviceMap`]
//! binds disjoint windows of that space to mapped UIO regions, and [`Uio`] performs reads, writes,
//! block transfers and read-modify-writes on it. Every hardware access runs inside a
//! [`SigBusGuard`](sigbus_guard::SigBusGuard), so a bus error from a missing or broken peripheral
//! comes back as [`Error::AccessFault`] instead of killing the process.
//!
//! Applications must block SIGBUS on every thread before the first access, the easiest way being
//! a call to [`block_sigbus`] at the very start of `main`.
//!
//! Single reads follow a deferred protocol: the returned [`ValWord`] can only be read after
//! [`Uio::dispatch`] ran.

mod config;
mod device_map;
mod engine;
mod error;
mod value;

pub use config::{Config, DeviceConfig};
pub use device_map::{DeviceMap, MappedDevice};
pub use engine::{BlockMode, NO_MASK, Uio};
pub use error::Error;
pub use sigbus_guard::block_sigbus;
pub use value::ValWord;

pub type Result<T> = core::result::Result<T, Error>;
