// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::device_map::{DeviceMap, MappedDevice};
use crate::{Error, ValWord};
use core::fmt;
use sigbus_guard::SigBusGuard;
use std::sync::Arc;

/// Mask selecting all 32 bits of a register.
pub const NO_MASK: u32 = 0xFFFF_FFFF;

/// Addressing mode of block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    /// Word `i` of the block lives at `address + i`.
    #[default]
    Incremental,
    /// Every word of the block goes to (or comes from) `address`, as for a FIFO port.
    NonIncremental,
}

/// Label attached to every guarded access, shows up in [`Error::AccessFault`].
struct RegisterLabel(u32);

impl fmt::Display for RegisterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reg: 0x{:08X}", self.0)
    }
}

/// A device together with the offset of an address inside it.
struct Resolved<'a> {
    device: &'a MappedDevice,
    offset: u32,
}

/// Register access engine over a flat, word-addressed 32-bit address space.
///
/// All hardware accesses are serialized process-wide by the SIGBUS guard, so many engines may
/// share one [`DeviceMap`] from different threads. An engine itself is not shared, it keeps
/// the set of reads awaiting [`dispatch`](Self::dispatch).
#[derive(Debug)]
pub struct Uio {
    devices: Arc<DeviceMap>,
    pending: Vec<ValWord>,
    dispatch_owed: bool,
}

impl Uio {
    pub fn new(devices: Arc<DeviceMap>) -> Self {
        Self {
            devices,
            pending: Vec::new(),
            dispatch_owed: false,
        }
    }

    pub fn device_map(&self) -> &Arc<DeviceMap> {
        &self.devices
    }

    /// Reads the register at `address`.
    ///
    /// The returned word stays invalid until the next [`dispatch`](Self::dispatch).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if no device covers `address`, [`Error::AccessFault`] if the
    /// bus faulted and [`Error::Guard`] if the fault guard could not be set up.
    pub fn read(&mut self, address: u32, mask: u32) -> crate::Result<ValWord> {
        let Resolved { device, offset } = self.resolve(address)?;
        let value = guarded_read(device, offset, address)?;
        tracing::trace!(address, value, mask, "read");

        let word = ValWord::pending(value, mask);
        self.pending.push(word.clone());
        self.dispatch_owed = true;
        Ok(word)
    }

    /// Writes `value` to the register at `address`.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn write(&mut self, address: u32, value: u32) -> crate::Result<()> {
        let Resolved { device, offset } = self.resolve(address)?;
        tracing::trace!(address, value, "write");
        guarded_write(device, offset, address, value)
    }

    /// Reads `count` words starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if any touched address lies outside the device, nothing is
    /// read in that case. Otherwise same as [`read`](Self::read).
    pub fn read_block(
        &mut self,
        address: u32,
        count: u32,
        mode: BlockMode,
    ) -> crate::Result<Vec<u32>> {
        let Resolved { device, offset } = self.resolve_block(address, count, mode)?;
        tracing::trace!(address, count, ?mode, "read block");

        (0..count)
            .map(|i| {
                let (offset, address) = step(offset, address, i, mode);
                guarded_read(device, offset, address)
            })
            .collect()
    }

    /// Writes `values` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if any touched address lies outside the device, nothing is
    /// written in that case. Otherwise same as [`read`](Self::read).
    pub fn write_block(
        &mut self,
        address: u32,
        values: &[u32],
        mode: BlockMode,
    ) -> crate::Result<()> {
        // a block longer than the address space can't fit any device
        let count = u32::try_from(values.len()).unwrap_or(u32::MAX);
        let Resolved { device, offset } = self.resolve_block(address, count, mode)?;
        tracing::trace!(address, count, ?mode, "write block");

        for (i, &value) in (0..count).zip(values) {
            let (offset, address) = step(offset, address, i, mode);
            guarded_write(device, offset, address, value)?;
        }
        Ok(())
    }

    /// Replaces the register at `address` with `(value & and) | or` and returns what the
    /// register reads back afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn rmw_bits(&mut self, address: u32, and: u32, or: u32) -> crate::Result<u32> {
        self.read_modify_write(address, |value| (value & and) | or)
    }

    /// Adds `addend` to the register at `address`, wrapping on overflow, and returns what the
    /// register reads back afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn rmw_sum(&mut self, address: u32, addend: i32) -> crate::Result<u32> {
        self.read_modify_write(address, |value| value.wrapping_add_signed(addend))
    }

    fn read_modify_write(
        &mut self,
        address: u32,
        modify: impl FnOnce(u32) -> u32,
    ) -> crate::Result<u32> {
        let Resolved { device, offset } = self.resolve(address)?;

        let old = guarded_read(device, offset, address)?;
        let new = modify(old);
        guarded_write(device, offset, address, new)?;
        // the hardware might latch something else than what we wrote
        let readback = guarded_read(device, offset, address)?;

        tracing::trace!(address, old, new, readback, "read-modify-write");
        Ok(readback)
    }

    /// Validates every word returned by [`read`](Self::read) since the last dispatch.
    pub fn dispatch(&mut self) {
        tracing::debug!(pending = self.pending.len(), "dispatch");
        for word in self.pending.drain(..) {
            word.validate();
        }
        self.dispatch_owed = false;
    }

    /// Whether reads happened since the last [`dispatch`](Self::dispatch).
    pub fn dispatch_owed(&self) -> bool {
        self.dispatch_owed
    }

    /// Number of words awaiting [`dispatch`](Self::dispatch).
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Byte-order transactions are not supported by UIO devices.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unimplemented`].
    pub fn byte_order_transaction(&mut self) -> crate::Result<()> {
        Err(Error::Unimplemented {
            function: "byte_order_transaction",
        })
    }

    fn resolve(&self, address: u32) -> crate::Result<Resolved<'_>> {
        let Some(device) = self.devices.find(address) else {
            return Err(Error::OutOfRange {
                address,
                window: None,
            });
        };

        if !device.contains(address) {
            return Err(Error::OutOfRange {
                address,
                window: Some(device.window()),
            });
        }

        Ok(Resolved {
            device,
            offset: address - device.base(),
        })
    }

    fn resolve_block(
        &self,
        address: u32,
        count: u32,
        mode: BlockMode,
    ) -> crate::Result<Resolved<'_>> {
        let resolved = self.resolve(address)?;

        if mode == BlockMode::Incremental && count > 0 {
            let last = u64::from(resolved.offset) + u64::from(count) - 1;
            if last >= u64::from(resolved.device.size()) {
                return Err(Error::OutOfRange {
                    address,
                    window: Some(resolved.device.window()),
                });
            }
        }

        Ok(resolved)
    }
}

/// Offset and flat address of word `i` of a block.
fn step(offset: u32, address: u32, i: u32, mode: BlockMode) -> (u32, u32) {
    match mode {
        BlockMode::Incremental => (offset + i, address.wrapping_add(i)),
        BlockMode::NonIncremental => (offset, address),
    }
}

fn guarded_read(device: &MappedDevice, offset: u32, address: u32) -> crate::Result<u32> {
    let ptr = device.word_ptr(offset);
    let guard = SigBusGuard::new(RegisterLabel(address))?;

    // Safety: `offset` is inside the device, and a bus error on the access is caught by the guard
    let res = unsafe { guard.protect(|| ptr.read_volatile()) };
    res.map_err(|err| access_error(address, err))
}

fn guarded_write(
    device: &MappedDevice,
    offset: u32,
    address: u32,
    value: u32,
) -> crate::Result<()> {
    let ptr = device.word_ptr(offset);
    let guard = SigBusGuard::new(RegisterLabel(address))?;

    // Safety: `offset` is inside the device, and a bus error on the access is caught by the guard
    let res = unsafe { guard.protect(|| ptr.write_volatile(value)) };
    res.map_err(|err| access_error(address, err))
}

fn access_error(address: u32, err: sigbus_guard::Error) -> Error {
    match err {
        sigbus_guard::Error::BusError { message, .. } => Error::AccessFault { address, message },
        err => Error::Guard(err),
    }
}
