// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Error;
use core::ops::Range;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::collections::btree_map;
use uio::Mapping;

/// A window `base..base + size` of the flat address space backed by mapped device memory.
///
/// Sizes and offsets are in 32-bit words, matching the flat address space.
#[derive(Debug)]
pub struct MappedDevice {
    name: Option<String>,
    base: u32,
    size: u32,
    memory: NonNull<u32>,
    /// Keeps `memory` alive, `None` for memory owned by someone else.
    _mapping: Option<Mapping>,
}

// Safety: `MappedDevice` only hands out raw pointers into device memory, and all accesses
// through them are serialized by the SIGBUS guard.
unsafe impl Send for MappedDevice {}

// Safety: see above
unsafe impl Sync for MappedDevice {}

impl MappedDevice {
    /// Binds all of `mapping` to the window starting at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDevice`] if the mapping is smaller than one word.
    pub fn new(base: u32, mapping: Mapping) -> crate::Result<Self> {
        let size = u32::try_from(mapping.len() / size_of::<u32>()).unwrap_or(u32::MAX);
        Self::with_size(base, mapping, size)
    }

    /// Binds the first `size` words of `mapping` to the window starting at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDevice`] if `size` is zero, [`Error::MappingTooSmall`] if the
    /// mapping has fewer than `size` words and [`Error::MisalignedMapping`] if the mapping doesn't
    /// start at a word boundary.
    pub fn with_size(base: u32, mapping: Mapping, size: u32) -> crate::Result<Self> {
        let fits = usize::try_from(size)
            .ok()
            .and_then(|words| words.checked_mul(size_of::<u32>()))
            .is_some_and(|bytes| bytes <= mapping.len());
        if !fits {
            return Err(Error::MappingTooSmall {
                base,
                size,
                mapped: mapping.len(),
            });
        }

        let memory =
            NonNull::new(mapping.as_mut_ptr().cast::<u32>()).ok_or(Error::EmptyDevice { base })?;
        if !memory.is_aligned() {
            return Err(Error::MisalignedMapping { base });
        }

        // Safety: the mapping is at least `size` words long and we keep it alive
        unsafe { Self::from_parts(base, memory, size, Some(mapping)) }
    }

    /// Binds memory owned elsewhere to the window starting at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDevice`] if `size` is zero.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for volatile reads and writes of `size` words, aligned to 4 bytes,
    /// and stay mapped for as long as the returned device exists.
    pub unsafe fn from_raw_parts(base: u32, memory: NonNull<u32>, size: u32) -> crate::Result<Self> {
        // Safety: ensured by caller
        unsafe { Self::from_parts(base, memory, size, None) }
    }

    unsafe fn from_parts(
        base: u32,
        memory: NonNull<u32>,
        size: u32,
        mapping: Option<Mapping>,
    ) -> crate::Result<Self> {
        if size == 0 {
            return Err(Error::EmptyDevice { base });
        }
        debug_assert!(memory.is_aligned());

        Ok(Self {
            name: None,
            base,
            size,
            memory,
            _mapping: mapping,
        })
    }

    /// Attaches a name used in log output and listings.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size of the window in words.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The window `base..base + size`, widened so the end can't overflow.
    pub fn window(&self) -> Range<u64> {
        u64::from(self.base)..u64::from(self.base) + u64::from(self.size)
    }

    pub fn contains(&self, address: u32) -> bool {
        self.window().contains(&u64::from(address))
    }

    /// Pointer to the word at `offset`, which must be below [`size`](Self::size).
    pub(crate) fn word_ptr(&self, offset: u32) -> *mut u32 {
        debug_assert!(offset < self.size);
        // Safety: in bounds per the debug assertion above, `offset < size` is checked by all
        // callers before any access
        unsafe { self.memory.as_ptr().add(offset as usize) }
    }
}

/// Ordered set of devices keyed by their base address.
///
/// Windows are assumed not to overlap, this is not checked.
#[derive(Debug, Default)]
pub struct DeviceMap {
    devices: BTreeMap<u32, MappedDevice>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `device`, returning the device previously registered at the same base address.
    pub fn insert(&mut self, device: MappedDevice) -> Option<MappedDevice> {
        if let Some(name) = device.name() {
            tracing::debug!(
                name,
                base = device.base,
                size = device.size,
                "registered device"
            );
        }
        self.devices.insert(device.base, device)
    }

    /// Returns the device with the largest base address not above `address`.
    ///
    /// The device is the only candidate owner of `address`, but `address` may still lie past
    /// its end, see [`MappedDevice::contains`].
    pub fn find(&self, address: u32) -> Option<&MappedDevice> {
        self.devices
            .range(..=address)
            .next_back()
            .map(|(_, device)| device)
    }

    /// Returns the device registered at exactly `base`.
    pub fn get(&self, base: u32) -> Option<&MappedDevice> {
        self.devices.get(&base)
    }

    pub fn iter(&self) -> btree_map::Values<'_, u32, MappedDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl FromIterator<MappedDevice> for DeviceMap {
    fn from_iter<T: IntoIterator<Item = MappedDevice>>(iter: T) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl Extend<MappedDevice> for DeviceMap {
    fn extend<T: IntoIterator<Item = MappedDevice>>(&mut self, iter: T) {
        for device in iter {
            self.insert(device);
        }
    }
}

impl<'a> IntoIterator for &'a DeviceMap {
    type Item = &'a MappedDevice;
    type IntoIter = btree_map::Values<'a, u32, MappedDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device(base: u32, size: u32) -> MappedDevice {
        let bytes = usize::try_from(size).unwrap() * size_of::<u32>();
        MappedDevice::new(base, Mapping::anonymous(bytes).unwrap()).unwrap()
    }

    #[test]
    fn floor_lookup() {
        let map: DeviceMap = [device(0x1000, 0x100), device(0x4000, 0x10)]
            .into_iter()
            .collect();

        assert_eq!(map.find(0x1000).map(MappedDevice::base), Some(0x1000));
        assert_eq!(map.find(0x10FF).map(MappedDevice::base), Some(0x1000));
        // past the end of the first window, but it is still the candidate
        assert_eq!(map.find(0x3FFF).map(MappedDevice::base), Some(0x1000));
        assert!(!map.find(0x3FFF).unwrap().contains(0x3FFF));
        assert_eq!(map.find(0xFFFF_FFFF).map(MappedDevice::base), Some(0x4000));
        assert!(map.find(0x0FFF).is_none());
    }

    #[test]
    fn empty_map_finds_nothing() {
        let map = DeviceMap::new();
        assert!(map.is_empty());
        assert!(map.find(0).is_none());
        assert!(map.find(u32::MAX).is_none());
    }

    #[test]
    fn insert_replaces_same_base() {
        let mut map = DeviceMap::new();
        assert!(map.insert(device(0x1000, 0x10).named("a")).is_none());
        let previous = map.insert(device(0x1000, 0x20).named("b")).unwrap();
        assert_eq!(previous.name(), Some("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0x1000).unwrap().size(), 0x20);
    }

    #[test]
    fn window_does_not_overflow() {
        let device = device(u32::MAX - 1, 0x10);
        assert_eq!(device.window(), 0xFFFF_FFFE..0x1_0000_000E);
        assert!(device.contains(u32::MAX));
    }

    #[test]
    fn rejects_bad_sizes() {
        let mapping = Mapping::anonymous(uio::host_page_size()).unwrap();
        assert!(matches!(
            MappedDevice::with_size(0, mapping, 0),
            Err(Error::EmptyDevice { base: 0 })
        ));

        let mapping = Mapping::anonymous(uio::host_page_size()).unwrap();
        let mapping = mapping.with_offset(2).unwrap();
        assert!(matches!(
            MappedDevice::with_size(0, mapping, 1),
            Err(Error::MisalignedMapping { base: 0 })
        ));

        let mapping = Mapping::anonymous(uio::host_page_size()).unwrap();
        let words = u32::try_from(uio::host_page_size()).unwrap();
        assert!(matches!(
            MappedDevice::with_size(0, mapping, words),
            Err(Error::MappingTooSmall { .. })
        ));
    }

    proptest! {
        #[test]
        fn find_returns_owner(bases in proptest::collection::btree_set(0u32..0x10_0000, 1..8), address in 0u32..0x20_0000) {
            // windows of 0x10 words, may touch but not overlap
            let bases: Vec<u32> = bases.into_iter().map(|base| base * 0x10).collect();
            let map: DeviceMap = bases.iter().map(|&base| device(base, 0x10)).collect();

            let expected = bases.iter().rev().find(|&&base| base <= address).copied();
            prop_assert_eq!(map.find(address).map(MappedDevice::base), expected);

            let owner = bases.iter().find(|&&base| base <= address && address - base < 0x10);
            let found = map.find(address).filter(|device| device.contains(address));
            prop_assert_eq!(found.map(MappedDevice::base), owner.copied());
        }
    }
}
