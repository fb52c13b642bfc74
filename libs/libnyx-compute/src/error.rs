//! Error types for compute runtime operations

use std::path::PathBuf;
use thiserror::Error;

/// Compute runtime errors
///
/// Every cache, transfer and dispatch operation reports failures through this
/// enum. Nothing is retried internally.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Host or device ran out of memory/resources
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The driver reports no platforms at all
    #[error("No compute platforms available")]
    NoPlatforms,

    /// Platform index out of range
    #[error("Platform {index} not found ({count} available)")]
    NoPlatform { index: usize, count: usize },

    /// Platform exposes no devices of the requested kind
    #[error("No {0} devices available")]
    NoDevices(crate::platform::DeviceKind),

    /// Device index out of range for the requested kind
    #[error("{kind} device {index} not found ({count} available)")]
    NoDevice {
        index: usize,
        kind: crate::platform::DeviceKind,
        count: usize,
    },

    /// Device rejected context creation
    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    /// Buffer size invalid or device allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Kernel source missing or too long
    #[error("Failed to load program {path:?}: {reason}")]
    ProgramLoad { path: PathBuf, reason: String },

    /// Device has no compiler
    #[error("Compiler not available: {0}")]
    CompilerNotAvailable(String),

    /// Program failed to build
    #[error("Program build failed:\n{log}")]
    BuildFailure { log: String },

    /// Entry point not present in the built program
    #[error("Invalid kernel name: {0}")]
    InvalidKernelName(String),

    /// Buffer has no device memory on this computer
    #[error("Buffer has not been sent to this computer")]
    NotSent,

    /// Write-only buffers cannot be read back
    #[error("Buffer is write-only and cannot be received")]
    ReadOnlyViolation,

    /// Resource already holds the maximum number of contexts
    #[error("Resource cache full ({capacity} contexts)")]
    CacheCapacityExceeded { capacity: usize },

    /// Grid shape rejected by the driver
    #[error("Invalid work size: {0}")]
    InvalidWorkSize(String),

    /// Kernel argument slot rejected or never bound
    #[error("Kernel argument {index}: {reason}")]
    KernelArgument { index: u32, reason: String },

    /// Computer was used after release
    #[error("Computer has been released")]
    ComputerReleased,

    /// Any other driver status
    #[error("Driver error in {operation}: {message}")]
    Driver { operation: &'static str, message: String },

    /// Configuration parse error
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for compute operations
pub type Result<T> = std::result::Result<T, ComputeError>;

impl ComputeError {
    /// Shorthand for a driver status the taxonomy has no dedicated kind for
    pub fn driver(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Driver {
            operation,
            message: message.into(),
        }
    }

    /// Check if this error reports host or device exhaustion
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory(_) | Self::AllocationFailed(_) | Self::CacheCapacityExceeded { .. }
        )
    }

    /// Check if this error comes from platform/device discovery
    pub fn is_discovery_failure(&self) -> bool {
        matches!(
            self,
            Self::NoPlatforms | Self::NoPlatform { .. } | Self::NoDevices(_) | Self::NoDevice { .. }
        )
    }

    /// Check if this error was raised while turning source into kernels
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::CompilerNotAvailable(_) | Self::BuildFailure { .. } | Self::InvalidKernelName(_)
        )
    }

    /// Check if a lookup by index or name found nothing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoPlatform { .. } | Self::NoDevice { .. } | Self::InvalidKernelName(_)
        )
    }

    /// Check if this error is a transfer-protocol violation
    pub fn is_transfer_violation(&self) -> bool {
        matches!(self, Self::NotSent | Self::ReadOnlyViolation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DeviceKind;

    #[test]
    fn test_error_classification() {
        assert!(ComputeError::OutOfMemory("queue".into()).is_resource_exhaustion());
        assert!(ComputeError::CacheCapacityExceeded { capacity: 4 }.is_resource_exhaustion());
        assert!(ComputeError::NoDevices(DeviceKind::Gpu).is_discovery_failure());
        assert!(ComputeError::BuildFailure { log: String::new() }.is_build_error());
        assert!(ComputeError::ReadOnlyViolation.is_transfer_violation());
        assert!(!ComputeError::NotSent.is_build_error());
        assert!(ComputeError::InvalidKernelName("main".into()).is_not_found());
        assert!(!ComputeError::NoPlatforms.is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = ComputeError::NoDevice {
            index: 3,
            kind: DeviceKind::Gpu,
            count: 1,
        };
        assert_eq!(err.to_string(), "GPU device 3 not found (1 available)");

        let err = ComputeError::driver("finish", "queue lost");
        assert_eq!(err.to_string(), "Driver error in finish: queue lost");
    }
}
