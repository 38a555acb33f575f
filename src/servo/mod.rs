//! Servo motion control
//!
//! [`MotionState`] is the pure filter; [`Servo`] runs it on a dedicated thread
//! at the configured update rate.

pub mod motion;
pub mod servo_handle;

pub use motion::{MotionConfig, MotionSnapshot, MotionState, PulseRange, SETTLE_THRESHOLD_US};
pub use servo_handle::Servo;
