//! Error kinds shared by the capture and servo subsystems
//!
//! Construction-time failures are reported synchronously through these variants and
//! never leave a partially built monitor or servo behind. Faults that happen inside a
//! worker thread are logged and absorbed there; they only surface here as `NotReady`
//! once a worker has given up.

use crate::gpio::HardwareError;

/// Errors returned by the capture and servo APIs
#[derive(Debug, thiserror::Error)]
pub enum HelifxError {
    /// A parameter was rejected before any resource was touched
    ///
    /// Bad ranges, out-of-range or reserved line ids, zero update rates.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded container is full
    ///
    /// Raised when every active-monitor slot is taken or the capture worker
    /// thread cannot be spawned.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The hardware line could not be configured or subscribed
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(#[from] HardwareError),

    /// The operation needs a worker or registry that is not (or no longer) running
    #[error("Not ready: {0}")]
    NotReady(String),
}

/// Result alias for the core APIs
pub type Result<T> = std::result::Result<T, HelifxError>;
