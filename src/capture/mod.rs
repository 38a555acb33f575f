//! PWM pulse-width capture
//!
//! An RC receiver emits one pulse per channel every 20 ms; the high time
//! (nominally 1000-2000 µs) encodes the stick position. Each [`Monitor`]
//! watches one receiver line, pairs rising and falling edges by their kernel
//! timestamps and publishes:
//!
//! - the latest accepted width, consumed on read
//! - a sliding-window mean over recent widths
//! - an optional per-pulse callback ([`PulseObserver`])
//!
//! Widths outside 500..=3000 µs are treated as noise and dropped. All started
//! monitors are served by a single capture worker owned by the
//! [`CaptureRegistry`].

mod capture_worker;
pub mod monitor;
pub mod registry;
pub mod sample_ring;

pub use monitor::{
    Monitor, MonitorStats, PulseObserver, PulseReading, MAX_AVERAGE_WINDOW,
    MAX_PLAUSIBLE_PULSE_US, MIN_AVERAGE_WINDOW, MIN_PLAUSIBLE_PULSE_US,
};
pub use registry::{CaptureRegistry, CaptureSettings};
pub use sample_ring::{Sample, SampleRing};
