//! Hardware line interface
//!
//! The capture subsystem never talks to GPIO registers directly. It consumes a
//! [`LineBackend`], which configures plain input/output lines and hands out one
//! [`EdgeSource`] per subscribed line. Two backends ship with the crate:
//!
//! ```text
//! RppalLines      - Raspberry Pi GPIO through rppal (synchronous interrupts)
//! SimulatedLines  - in-memory lines with a virtual clock, used by tests and --simulate
//! ```
//!
//! Dropping an [`EdgeSource`] releases the line subscription.

pub mod rppal_lines;
pub mod simulated;

pub use rppal_lines::{RppalLines, RppalSource};
pub use simulated::{SimulatedLines, SimulatedSource, SweepHandle, SweepSettings};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HelifxError;

/// Highest BCM line number exposed on the 40-pin header
pub const MAX_LINE_ID: u8 = 27;

/// Lines permanently owned by the WM8960 audio HAT
///
/// I2C SDA/SCL (2, 3) and I2S BCK/LRCK/DIN/DOUT (18-21).
pub const RESERVED_LINES: [u8; 6] = [2, 3, 18, 19, 20, 21];

/// Line direction for plain (non edge-subscribed) use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// Built-in bias resistor setting of an input line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    #[default]
    Off,
    Down,
    Up,
}

/// Edge polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Rising,
    Falling,
}

/// One transition reported by an [`EdgeSource`]
///
/// `timestamp_ns` comes from the kernel's monotonic clock (or the simulated
/// clock); only differences between timestamps of the same line are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub edge: Edge,
    pub timestamp_ns: u64,
}

impl EdgeEvent {
    pub fn rising(timestamp_ns: u64) -> Self {
        Self {
            edge: Edge::Rising,
            timestamp_ns,
        }
    }

    pub fn falling(timestamp_ns: u64) -> Self {
        Self {
            edge: Edge::Falling,
            timestamp_ns,
        }
    }
}

/// Failures reported by a hardware backend
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// Error from the Raspberry Pi GPIO driver
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Line {0} is outside the usable range 0-{MAX_LINE_ID}")]
    OutOfRange(u8),

    #[error("Line {0} is reserved for the WM8960 audio HAT")]
    Reserved(u8),

    #[error("Line {0} is already in use")]
    LineBusy(u8),

    #[error("Line {0} is not configured")]
    NotConfigured(u8),

    #[error("Line {0} is not configured as {1:?}")]
    WrongDirection(u8, Direction),

    /// The readiness wait returned early because of a signal; retry it
    #[error("Readiness wait interrupted")]
    Interrupted,

    /// Subscription, drain or readiness failure not covered above
    #[error("Edge source failure: {0}")]
    EdgeSource(String),
}

/// Returns true for lines owned by other peripherals
pub fn is_reserved_line(line_id: u8) -> bool {
    RESERVED_LINES.contains(&line_id)
}

/// Backend-side line check
pub fn check_line(line_id: u8) -> Result<(), HardwareError> {
    if line_id > MAX_LINE_ID {
        return Err(HardwareError::OutOfRange(line_id));
    }
    if is_reserved_line(line_id) {
        return Err(HardwareError::Reserved(line_id));
    }
    Ok(())
}

/// Caller-side line check, reported as an invalid argument
pub fn validate_line(line_id: u8) -> crate::Result<()> {
    check_line(line_id).map_err(|e| HelifxError::InvalidArgument(e.to_string()))
}

/// Edge-event subscription on one line
///
/// Shared between the monitor that owns it and the capture worker, so every
/// method takes `&self`.
pub trait EdgeSource: Send + Sync + 'static {
    fn line_id(&self) -> u8;

    /// Appends every pending edge to `out` without blocking
    fn read_edges(&self, out: &mut Vec<EdgeEvent>) -> Result<(), HardwareError>;
}

/// GPIO primitives consumed by the capture subsystem
pub trait LineBackend: Send + Sync + 'static {
    type Source: EdgeSource;

    fn configure_line(&self, line_id: u8, direction: Direction) -> Result<(), HardwareError>;

    fn write_line(&self, line_id: u8, high: bool) -> Result<(), HardwareError>;

    fn read_line(&self, line_id: u8) -> Result<bool, HardwareError>;

    /// Records the bias for `line_id`
    ///
    /// Applied at once to a line configured as input, otherwise at the next
    /// `configure_line` or `subscribe_edges` on it.
    ///
    /// # Errors
    ///
    /// [`HardwareError::WrongDirection`] for a line configured as output.
    fn set_pull(&self, line_id: u8, pull: Pull) -> Result<(), HardwareError>;

    /// Requests both-edge events on `line_id`
    fn subscribe_edges(&self, line_id: u8) -> Result<Self::Source, HardwareError>;

    /// Blocks until at least one source has pending edges or `timeout` elapses
    ///
    /// Returns the indices (into `sources`) of the sources that became readable;
    /// an empty vector means the timeout expired.
    ///
    /// # Errors
    ///
    /// [`HardwareError::Interrupted`] asks the caller to retry. Any other error
    /// means the wait cannot be re-armed.
    fn wait_ready(
        &self,
        sources: &[&Self::Source],
        timeout: Duration,
    ) -> Result<Vec<usize>, HardwareError>;

    /// Makes a concurrent (or the next) `wait_ready` return early with no
    /// ready sources
    fn wake(&self);
}
