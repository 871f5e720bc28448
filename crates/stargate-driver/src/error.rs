//! Error types for device dispatch

use crate::backend::BackendKind;
use crate::device::DeviceId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while discovering or driving a device
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Kernel device file missing or unopenable
    #[error("Device absent: {path}")]
    DeviceAbsent {
        /// Path that was opened
        path: PathBuf,
    },

    /// Driver or platform API failed during discovery
    #[error("{backend} enumeration failed: {reason}")]
    EnumerationFailure {
        /// Backend that was enumerating
        backend: BackendKind,
        /// Reason for failure
        reason: String,
    },

    /// Operation referred to a configuration that is not live
    #[error("Invalid config for device {id}: {reason}")]
    InvalidConfig {
        /// Logical device id
        id: DeviceId,
        /// Reason for rejection
        reason: String,
    },

    /// Logical id outside every backend's range
    #[error("Device id {id} out of range (have {count} devices)")]
    UnknownDevice {
        /// Requested id
        id: DeviceId,
        /// Number of enumerated devices
        count: usize,
    },

    /// Kernel transfer returned a negative status
    #[error("Transfer failed with status {code}")]
    TransferFailure {
        /// Negative status from the driver (`-errno`)
        code: i32,
    },

    /// Compute kernel returned a non-success status
    #[error("Kernel execution failed with status {status}")]
    KernelExecutionFailure {
        /// Status returned by the kernel
        status: i32,
    },

    /// Execution context or queue creation failed; the backend is unusable
    #[error("Backend initialisation failed: {reason}")]
    BackendInit {
        /// Reason for failure
        reason: String,
    },

    /// Request parameter rejected before reaching the device
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// LIST reported more boards than the record can describe
    #[error("Driver reported {reported} boards, at most {max} supported")]
    TooManyBoards {
        /// Count reported by the driver
        reported: i32,
        /// Supported maximum
        max: usize,
    },

    /// Input data file could not be parsed
    #[error("{}:{line}: {reason}", path.display())]
    InputParse {
        /// Input file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// Reason for failure
        reason: String,
    },

    /// Backend is not in a state that allows the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error outside a kernel transfer
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DispatchError {
    /// Create an invalid config error
    pub fn invalid_config(id: DeviceId, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            id,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an enumeration failure error
    pub fn enumeration_failure(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::EnumerationFailure {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a backend initialisation error
    pub fn backend_init(reason: impl Into<String>) -> Self {
        Self::BackendInit {
            reason: reason.into(),
        }
    }

    /// Whether the error leaves its backend permanently unavailable
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendInit { .. })
    }

    /// Whether the error is the kernel reporting a timed-out transfer
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TransferFailure { code } if *code == -stargate_wire::pcie::ETIMEDOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_init_is_fatal() {
        assert!(DispatchError::backend_init("no context").is_fatal());
        assert!(!DispatchError::TransferFailure { code: -5 }.is_fatal());
        assert!(!DispatchError::invalid_config(3, "closed").is_fatal());
    }

    #[test]
    fn timeout_is_recognised_from_errno() {
        assert!(DispatchError::TransferFailure { code: -110 }.is_timeout());
        assert!(!DispatchError::TransferFailure { code: -5 }.is_timeout());
    }

    #[test]
    fn messages_name_the_device() {
        let e = DispatchError::UnknownDevice { id: 7, count: 3 };
        assert_eq!(e.to_string(), "Device id 7 out of range (have 3 devices)");
    }
}
