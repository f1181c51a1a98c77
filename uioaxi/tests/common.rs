// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use std::sync::Arc;
use uio::Mapping;
use uioaxi::{DeviceMap, MappedDevice, Uio};

/// Blocks SIGBUS on the calling test thread and builds an engine over anonymous memory.
pub fn engine(devices: &[(u32, u32)]) -> Uio {
    uioaxi::block_sigbus().unwrap();
    Uio::new(Arc::new(device_map(devices)))
}

pub fn device_map(devices: &[(u32, u32)]) -> DeviceMap {
    devices
        .iter()
        .map(|&(base, size)| anonymous(base, size))
        .collect()
}

pub fn anonymous(base: u32, size: u32) -> MappedDevice {
    let bytes = usize::try_from(size).unwrap() * size_of::<u32>();
    MappedDevice::new(base, Mapping::anonymous(bytes).unwrap()).unwrap()
}
