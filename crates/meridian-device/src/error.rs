//! Error types for device operations

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors reported by device runtimes, allocators and communicators
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// The allocator could not satisfy a request
    #[error("out of memory on {device}: requested {requested} bytes in memory space {memory_space}")]
    OutOfMemory {
        device: String,
        requested: usize,
        memory_space: u32,
    },

    /// Region does not belong to any live allocation
    #[error("invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// Access past the end of an allocation
    #[error("device access out of bounds: address {address:#x} + size {size} exceeds allocation of {allocation_size} bytes")]
    OutOfBounds {
        address: u64,
        size: usize,
        allocation_size: usize,
    },

    /// Device ordinal not known to the runtime
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Module handle not known to the runtime
    #[error("unknown module handle: {0}")]
    UnknownModule(u64),

    /// Kernel symbol missing from a loaded module
    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    /// Kernel reported a failure while running
    #[error("kernel {kernel} failed: {message}")]
    KernelFailed { kernel: String, message: String },

    /// Communication library failure
    #[error("communication error: {0}")]
    Communication(String),

    /// A blocking device or communication call did not finish in time
    #[error("{what} timed out after {timeout_ms} ms")]
    Timeout { what: String, timeout_ms: u64 },

    /// Operation not supported by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}
