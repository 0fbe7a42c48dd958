//! Parameter - Shared Trainable Tensors
//!
//! A `Parameter` is a handle to a flat `f32` buffer with a shape, an optional
//! gradient and a trainable flag. Handles are cheap to clone and every clone
//! observes the same data, so an optimizer, a model and a communication bucket
//! can all hold the same parameter. The backing storage can be re-pointed at a
//! view of a larger buffer without the holders noticing.
//!
//! Each parameter carries a process-unique [`ParamId`] used as the identity key
//! for optimizer state.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::storage::Storage;

// =============================================================================
// ParamId
// =============================================================================

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Default for ParamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param#{}", self.0)
    }
}

// =============================================================================
// Parameter
// =============================================================================

#[derive(Debug)]
struct ParameterInner {
    data: Storage,
    shape: Vec<usize>,
    grad: Option<Vec<f32>>,
    requires_grad: bool,
}

/// A trainable tensor shared between its holders.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<RwLock<ParameterInner>>,
    id: ParamId,
    name: String,
}

impl Parameter {
    /// Creates a parameter on the CPU.
    ///
    /// # Arguments
    /// * `values` - Flat row-major data
    /// * `shape` - Logical shape; its product must equal `values.len()`
    /// * `requires_grad` - Whether the parameter is trainable
    pub fn new(values: Vec<f32>, shape: &[usize], requires_grad: bool) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(Error::length_mismatch(expected, values.len()));
        }
        Ok(Self::with_storage(
            Storage::from_vec(values, Device::Cpu),
            shape.to_vec(),
            requires_grad,
        ))
    }

    /// Creates a trainable 1-D parameter from a vector.
    #[must_use]
    pub fn from_vec(values: Vec<f32>) -> Self {
        let shape = vec![values.len()];
        Self::with_storage(Storage::from_vec(values, Device::Cpu), shape, true)
    }

    fn with_storage(data: Storage, shape: Vec<usize>, requires_grad: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ParameterInner {
                data,
                shape,
                grad: None,
                requires_grad,
            })),
            id: ParamId::new(),
            name: String::new(),
        }
    }

    /// Sets the parameter name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Moves the parameter data to `device`.
    #[must_use]
    pub fn with_device(self, device: Device) -> Self {
        {
            let mut inner = self.inner.write();
            inner.data = inner.data.to_device(device);
        }
        self
    }

    /// Returns the identity of this parameter.
    #[must_use]
    pub const fn id(&self) -> ParamId {
        self.id
    }

    /// Returns the parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Returns the logical shape.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.inner.read().shape.clone()
    }

    /// Returns the device holding the data.
    #[must_use]
    pub fn device(&self) -> Device {
        self.inner.read().data.device()
    }

    /// Returns whether this parameter is trainable.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.inner.read().requires_grad
    }

    /// Marks the parameter trainable or frozen.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.inner.write().requires_grad = requires_grad;
    }

    /// Returns a copy of the current values.
    #[must_use]
    pub fn data(&self) -> Vec<f32> {
        self.inner.read().data.to_vec()
    }

    /// Returns a handle to the backing storage.
    #[must_use]
    pub fn storage(&self) -> Storage {
        self.inner.read().data.clone()
    }

    /// Re-points the parameter at another storage of the same length.
    pub fn set_storage(&self, storage: Storage) -> Result<()> {
        let mut inner = self.inner.write();
        if storage.len() != inner.data.len() {
            return Err(Error::length_mismatch(inner.data.len(), storage.len()));
        }
        inner.data = storage;
        Ok(())
    }

    /// Overwrites the parameter values.
    pub fn set_data(&self, values: &[f32]) -> Result<()> {
        self.inner.read().data.copy_from_slice(values)
    }

    /// Returns a copy of the gradient, if any.
    #[must_use]
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.inner.read().grad.clone()
    }

    /// Returns true if a gradient is attached.
    #[must_use]
    pub fn has_grad(&self) -> bool {
        self.inner.read().grad.is_some()
    }

    /// Attaches a gradient.
    pub fn set_grad(&self, grad: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.write();
        if grad.len() != inner.data.len() {
            return Err(Error::length_mismatch(inner.data.len(), grad.len()));
        }
        inner.grad = Some(grad);
        Ok(())
    }

    /// Drops the gradient.
    pub fn zero_grad(&self) {
        self.inner.write().grad = None;
    }

    /// Multiplies the gradient in place. No-op without a gradient.
    pub fn scale_grad(&self, factor: f32) {
        if let Some(grad) = self.inner.write().grad.as_mut() {
            grad.iter_mut().for_each(|g| *g *= factor);
        }
    }

    /// Runs `f(data, grad)` if a gradient is attached.
    ///
    /// Returns false when there was no gradient and nothing ran.
    pub fn apply_update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut [f32], &[f32]),
    {
        let inner = self.inner.read();
        let Some(grad) = inner.grad.as_ref() else {
            return false;
        };
        let mut data = inner.data.as_slice_mut();
        f(&mut data, grad);
        true
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Parameter {}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.shape())
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
