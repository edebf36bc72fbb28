//! Error types for meridian-runtime operations

use meridian_device::DeviceError;
use std::time::Duration;

/// Result type for meridian-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by an execution
///
/// Cloneable so that a failed clique initialization can be handed to every
/// caller that waited on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The caller violated an execution contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Plan, device or resource declarations are inconsistent
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// An allocation failed
    #[error("Resource exhausted: failed to allocate {requested} bytes{}{}", slot_suffix(.slot), report_suffix(.report))]
    ResourceExhausted {
        requested: usize,
        slot: Option<usize>,
        report: Option<String>,
    },

    /// Bug in the plan or the runtime
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation not available on this platform
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// A rendezvous or collective did not complete in time
    #[error("Deadline exceeded: {what} did not complete within {timeout:?}")]
    DeadlineExceeded { what: String, timeout: Duration },
}

fn slot_suffix(slot: &Option<usize>) -> String {
    slot.map(|index| format!(" for allocation slot {index}")).unwrap_or_default()
}

fn report_suffix(report: &Option<String>) -> String {
    report.as_ref().map(|r| format!("\n{r}")).unwrap_or_default()
}

/// Fieldless error category, convenient for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    Internal,
    Unimplemented,
    DeadlineExceeded,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Unimplemented(_) => ErrorKind::Unimplemented,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Error::Unimplemented(msg.into())
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory { requested, .. } => Error::ResourceExhausted {
                requested,
                slot: None,
                report: Some(err.to_string()),
            },
            DeviceError::Timeout { what, timeout_ms } => Error::DeadlineExceeded {
                what,
                timeout: Duration::from_millis(timeout_ms),
            },
            DeviceError::Unsupported(msg) => Error::Unimplemented(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_keep_their_category() {
        let oom: Error = DeviceError::OutOfMemory {
            device: "device:0".into(),
            requested: 64,
            memory_space: 0,
        }
        .into();
        assert!(matches!(oom, Error::ResourceExhausted { requested: 64, .. }));

        let timeout: Error = DeviceError::Timeout {
            what: "all-reduce".into(),
            timeout_ms: 5,
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::DeadlineExceeded);

        assert_eq!(Error::from(DeviceError::unsupported("fp8")).kind(), ErrorKind::Unimplemented);
        assert_eq!(Error::from(DeviceError::InvalidAddress(0x40)).kind(), ErrorKind::Internal);
    }

    #[test]
    fn exhaustion_message_names_slot_and_report() {
        let err = Error::ResourceExhausted {
            requested: 4096,
            slot: Some(3),
            report: Some("slot 0: 16 bytes".into()),
        };
        let message = err.to_string();
        assert!(message.contains("4096 bytes for allocation slot 3"));
        assert!(message.ends_with("slot 0: 16 bytes"));
    }
}
