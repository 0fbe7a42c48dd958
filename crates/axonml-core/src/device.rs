//! Device Abstraction - Placement of Parameters and Optimizer State
//!
//! Every parameter, storage buffer and optimizer state blob carries the device
//! it lives on. Sharded optimizers group communication per device, and state is
//! staged on the host while it is consolidated.
//!
//! # Example
//! ```rust
//! use axonml_core::Device;
//!
//! let cpu = Device::Cpu;
//! assert!(cpu.is_cpu());
//! assert_eq!(Device::default(), Device::Cpu);
//! assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
//! ```
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use core::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Device Enum
// =============================================================================

/// Represents a compute device where parameters and state are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory.
    Cpu,

    /// NVIDIA CUDA GPU device with device index.
    Cuda(usize),
}

impl Device {
    /// Returns true if this is a CPU device.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Returns true if this is a GPU device.
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        !self.is_cpu()
    }

    /// Returns the name of this device type.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kinds() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_gpu());
        assert!(Device::Cuda(0).is_gpu());
        assert_eq!(Device::Cuda(3).device_type(), "cuda");
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(0).to_string(), "cuda:0");
    }
}
