// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A type that "owns" a memory mapped region. Acts as a RAII guard for the region, unmapping it
//! on drop.

use crate::Error;
use core::ptr::{self, NonNull};
use rustix::mm::{MapFlags, ProtFlags};
use std::os::fd::AsFd;

#[derive(Debug)]
pub struct Mapping {
    /// The whole region as returned by `mmap`.
    memory: NonNull<[u8]>,
    /// Start of the accessible part of `memory`.
    start: usize,
}

// Safety: the mapping is plain memory that stays valid until `drop`. Synchronizing accesses to
// its contents is up to the user, all accessors hand out raw pointers.
unsafe impl Send for Mapping {}

// Safety: see above
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps `len` bytes of zeroed, private, anonymous memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyMapping`] if `len` is zero and [`Error::Mmap`] if the kernel refused
    /// the mapping.
    pub fn anonymous(len: usize) -> crate::Result<Self> {
        if len == 0 {
            return Err(Error::EmptyMapping);
        }

        // Safety: we pass a nullptr so the kernel will allocate memory for us.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };

        Ok(Self::from_raw(ptr, len))
    }

    /// Maps `len` bytes of `fd`, starting at `offset`, read-write and shared.
    ///
    /// For UIO devices `offset` selects the memory region, see [`UioDevice::map`].
    ///
    /// [`UioDevice::map`]: crate::UioDevice::map
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyMapping`] if `len` is zero and [`Error::Mmap`] if the kernel refused
    /// the mapping.
    pub fn shared<Fd: AsFd>(fd: Fd, offset: u64, len: usize) -> crate::Result<Self> {
        if len == 0 {
            return Err(Error::EmptyMapping);
        }

        // Safety: we pass a nullptr so the kernel picks a fresh range for us.
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };

        tracing::trace!(?ptr, len, offset, "mapped shared region");

        Ok(Self::from_raw(ptr, len))
    }

    fn from_raw(ptr: *mut core::ffi::c_void, len: usize) -> Self {
        // Safety: a successful mmap never returns null
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
        Self {
            memory: NonNull::slice_from_raw_parts(base, len),
            start: 0,
        }
    }

    /// Hides the first `offset` bytes of the region, [`as_ptr`](Self::as_ptr) then points at
    /// byte `offset`. The whole region stays mapped until drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyMapping`] if nothing of the region would be left.
    pub fn with_offset(mut self, offset: usize) -> crate::Result<Self> {
        if offset >= self.memory.len() {
            return Err(Error::EmptyMapping);
        }
        self.start = offset;
        Ok(self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_mut_ptr().cast_const()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // Safety: `start` is inside the region, see `with_offset`
        unsafe { self.memory.as_ptr().cast::<u8>().add(self.start) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: we own the mapping and nobody can observe it past this point
        let res = unsafe { rustix::mm::munmap(self.memory.as_ptr().cast(), self.memory.len()) };
        if let Err(err) = res {
            tracing::error!("munmap failed: {err}");
        }
    }
}
