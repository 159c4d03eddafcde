//! Result codes and log levels.

use thiserror::Error;

/// Error conditions reported by the library.
///
/// `Vulkan` poisons the instance: after it is reported, only destruction is
/// valid. `InvalidInput` leaves the instance usable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiftError {
    /// Device loss, fence timeout or submission failure.
    #[error("Vulkan device failure")]
    Vulkan,

    /// Bad buffer id, oversized image, mismatched descriptor format.
    #[error("invalid input")]
    InvalidInput,

    /// Device or staging allocation failure.
    #[error("out of device memory")]
    OutOfMemory,
}

/// Result type alias.
pub type SiftResult<T> = std::result::Result<T, SiftError>;

/// Logging verbosity, set process-wide with `set_log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Disable all library logging.
    None,
}
