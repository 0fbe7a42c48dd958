//! Storage - Shared Memory Buffers for Parameters
//!
//! Provides reference-counted `f32` buffers that back parameters and flat
//! communication buckets. A `Storage` is a window (offset, length) into a
//! shared buffer, so several parameters can alias disjoint ranges of one
//! contiguous arena and a write through the arena is visible through every
//! parameter that views it.
//!
//! # Key Features
//! - Reference-counted memory for zero-copy views
//! - Device tag carried with every buffer
//! - Aliasing detection between views
//! - In-place truncation of root buffers
//!
//! # Example
//! ```rust
//! use axonml_core::{Device, Storage};
//!
//! let arena = Storage::zeros(8, Device::Cpu);
//! let view = arena.slice(2, 3).unwrap();
//! view.as_slice_mut().copy_from_slice(&[1.0, 2.0, 3.0]);
//! assert_eq!(arena.to_vec(), vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
//! ```
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;
use crate::error::{Error, Result};

// =============================================================================
// Storage Struct
// =============================================================================

/// Shared `f32` memory with an offset/length window.
///
/// Cloning a `Storage` produces another handle to the same memory; use
/// [`Storage::deep_copy`] for an independent buffer.
#[derive(Debug)]
pub struct Storage {
    /// The underlying data buffer.
    inner: Arc<RwLock<StorageInner>>,
    /// Offset into the buffer (for views).
    offset: usize,
    /// Number of elements in this view.
    len: usize,
}

#[derive(Debug)]
struct StorageInner {
    data: Vec<f32>,
    device: Device,
}

impl Storage {
    /// Creates new storage with the given length, initialized to zero.
    #[must_use]
    pub fn zeros(len: usize, device: Device) -> Self {
        Self::from_vec(vec![0.0; len], device)
    }

    /// Creates storage that takes ownership of an existing vector.
    #[must_use]
    pub fn from_vec(data: Vec<f32>, device: Device) -> Self {
        let len = data.len();
        Self {
            inner: Arc::new(RwLock::new(StorageInner { data, device })),
            offset: 0,
            len,
        }
    }

    /// Creates storage from a slice by copying the data.
    #[must_use]
    pub fn from_slice(data: &[f32], device: Device) -> Self {
        Self::from_vec(data.to_vec(), device)
    }

    /// Returns the number of elements in this storage view.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the storage is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the offset into the underlying buffer.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the device this storage is on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.inner.read().device
    }

    /// Creates a view into a portion of this storage.
    ///
    /// # Arguments
    /// * `offset` - Starting offset relative to this view
    /// * `len` - Number of elements in the new view
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        if offset + len > self.len {
            return Err(Error::IndexOutOfBounds {
                index: offset + len,
                size: self.len,
            });
        }

        Ok(Self {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            len,
        })
    }

    /// Returns true if both handles point into the same underlying buffer.
    #[must_use]
    pub fn shares_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a read guard over the viewed elements.
    #[must_use]
    pub fn as_slice(&self) -> StorageReadGuard<'_> {
        StorageReadGuard {
            guard: self.inner.read(),
            offset: self.offset,
            len: self.len,
        }
    }

    /// Returns a write guard over the viewed elements.
    #[must_use]
    pub fn as_slice_mut(&self) -> StorageWriteGuard<'_> {
        StorageWriteGuard {
            guard: self.inner.write(),
            offset: self.offset,
            len: self.len,
        }
    }

    /// Copies the viewed elements into a new vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// Copies data from another storage into this one.
    ///
    /// Views of the same buffer are handled by staging the source first.
    pub fn copy_from(&self, other: &Self) -> Result<()> {
        if self.len != other.len {
            return Err(Error::length_mismatch(self.len, other.len));
        }

        if self.shares_buffer(other) {
            let staged = other.to_vec();
            self.as_slice_mut().copy_from_slice(&staged);
        } else {
            let src = other.as_slice();
            let mut dst = self.as_slice_mut();
            dst.copy_from_slice(&src);
        }
        Ok(())
    }

    /// Copies a host slice into this storage.
    pub fn copy_from_slice(&self, values: &[f32]) -> Result<()> {
        if self.len != values.len() {
            return Err(Error::length_mismatch(self.len, values.len()));
        }
        self.as_slice_mut().copy_from_slice(values);
        Ok(())
    }

    /// Makes a deep copy of this view into a fresh buffer.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self::from_vec(self.to_vec(), self.device())
    }

    /// Transfers this storage to a different device.
    ///
    /// Returns a handle to the same memory when the device already matches.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        if self.device() == device {
            return self.clone();
        }
        Self::from_vec(self.to_vec(), device)
    }

    /// Shrinks a root buffer to `len` elements.
    ///
    /// Views created earlier stay valid as long as they end within `len`.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        if self.offset != 0 {
            return Err(Error::invalid_operation("cannot truncate a storage view"));
        }
        if len > self.len {
            return Err(Error::IndexOutOfBounds {
                index: len,
                size: self.len,
            });
        }

        let mut inner = self.inner.write();
        inner.data.truncate(len);
        inner.data.shrink_to_fit();
        drop(inner);
        self.len = len;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            offset: self.offset,
            len: self.len,
        }
    }
}

// =============================================================================
// Guard Types for Safe Access
// =============================================================================

/// Read guard for storage data.
pub struct StorageReadGuard<'a> {
    guard: parking_lot::RwLockReadGuard<'a, StorageInner>,
    offset: usize,
    len: usize,
}

impl Deref for StorageReadGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.guard.data[self.offset..self.offset + self.len]
    }
}

/// Write guard for storage data.
pub struct StorageWriteGuard<'a> {
    guard: parking_lot::RwLockWriteGuard<'a, StorageInner>,
    offset: usize,
    len: usize,
}

impl Deref for StorageWriteGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.guard.data[self.offset..self.offset + self.len]
    }
}

impl DerefMut for StorageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data[self.offset..self.offset + self.len]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_zeros() {
        let storage = Storage::zeros(10, Device::Cpu);
        assert_eq!(storage.len(), 10);
        assert!(storage.to_vec().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_storage_slice_aliases_parent() {
        let arena = Storage::zeros(6, Device::Cpu);
        let a = arena.slice(0, 2).unwrap();
        let b = arena.slice(2, 4).unwrap();

        a.copy_from_slice(&[1.0, 2.0]).unwrap();
        b.as_slice_mut()[0] = 7.0;

        assert_eq!(arena.to_vec(), vec![1.0, 2.0, 7.0, 0.0, 0.0, 0.0]);
        assert!(a.shares_buffer(&b));
        assert_eq!(b.offset(), 2);
    }

    #[test]
    fn test_storage_deep_copy_is_independent() {
        let storage1 = Storage::from_vec(vec![1.0, 2.0, 3.0], Device::Cpu);
        let storage2 = storage1.deep_copy();

        storage2.as_slice_mut()[0] = 99.0;

        assert_eq!(storage1.as_slice()[0], 1.0);
        assert!(!storage1.shares_buffer(&storage2));
    }

    #[test]
    fn test_storage_copy_from_same_buffer() {
        let arena = Storage::from_vec(vec![1.0, 2.0, 3.0, 4.0], Device::Cpu);
        let lo = arena.slice(0, 2).unwrap();
        let hi = arena.slice(2, 2).unwrap();

        lo.copy_from(&hi).unwrap();
        assert_eq!(arena.to_vec(), vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_storage_copy_length_mismatch() {
        let dst = Storage::zeros(3, Device::Cpu);
        let err = dst.copy_from_slice(&[1.0]).unwrap_err();
        assert_eq!(err, Error::length_mismatch(3, 1));
    }

    #[test]
    fn test_storage_truncate_keeps_views() {
        let mut arena = Storage::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0], Device::Cpu);
        let view = arena.slice(1, 2).unwrap();

        arena.truncate(3).unwrap();
        assert_eq!(arena.len(), 3);
        assert_eq!(view.to_vec(), vec![2.0, 3.0]);

        assert!(view.clone().truncate(1).is_err());
        assert!(arena.truncate(10).is_err());
    }

    #[test]
    fn test_storage_to_device() {
        let storage = Storage::from_vec(vec![1.0, 2.0], Device::Cpu);
        let same = storage.to_device(Device::Cpu);
        assert!(same.shares_buffer(&storage));

        let moved = storage.to_device(Device::Cuda(1));
        assert_eq!(moved.device(), Device::Cuda(1));
        assert_eq!(moved.to_vec(), vec![1.0, 2.0]);
        assert!(!moved.shares_buffer(&storage));
    }

    #[test]
    fn test_storage_slice_out_of_bounds() {
        let storage = Storage::zeros(10, Device::Cpu);
        assert!(storage.slice(5, 10).is_err());
    }
}
