// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Error;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The result of a single register read.
///
/// A `ValWord` starts out invalid and is validated by the [`dispatch`](crate::Uio::dispatch) that
/// follows the read. The engine keeps a handle to every pending word, clones share the validity.
#[derive(Debug, Clone)]
pub struct ValWord {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    value: u32,
    mask: u32,
    valid: AtomicBool,
}

impl ValWord {
    pub(crate) fn pending(value: u32, mask: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                value,
                mask,
                valid: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn validate(&self) {
        self.inner.valid.store(true, Ordering::Release);
    }

    pub fn valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    pub fn mask(&self) -> u32 {
        self.inner.mask
    }

    /// The masked bit-field, shifted down so the lowest bit of the mask becomes bit 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotValidated`] until the read has been dispatched.
    pub fn value(&self) -> crate::Result<u32> {
        if !self.valid() {
            return Err(Error::NotValidated);
        }

        let Inner { value, mask, .. } = *self.inner;
        if mask == 0 {
            return Ok(0);
        }

        Ok((value & mask) >> mask.trailing_zeros())
    }
}
