//! Error types for registry operations.
//!
//! The registry deliberately keeps its error surface narrow: rejected
//! registrations and advisory no-ops are expressed in return values, not
//! errors. What remains here is the handful of genuinely exceptional
//! conditions - wire failures, a stopped node - all of which are absorbed
//! locally and never fatal to the registrar itself.

use thiserror::Error;

/// The main error type for registry operations.
///
/// All fallible operations in namecast return `Result<T, RegistryError>`.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry node is not running (stopped or never started).
    #[error("registry is not running")]
    Stopped,

    /// A network operation failed (connect, read, write, bind).
    #[error("network error: {0}")]
    Network(String),

    /// A wire frame exceeded the protocol size limit.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed frame size in bytes.
        size: usize,
        /// Protocol maximum in bytes.
        max: usize,
    },

    /// Serialization error when encoding or decoding a wire message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
