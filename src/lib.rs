//! helifx: PWM capture and servo motion control for RC special-effects rigs
//!
//! Receiver channels are measured by [`capture`] monitors, shaped by
//! [`servo`] motion filters and wired together by the [`orchestrator`].
//! All GPIO access goes through the [`gpio`] backends.

pub mod capture;
pub mod config;
pub mod error;
pub mod gpio;
pub mod logging;
pub mod orchestrator;
pub mod servo;

pub use error::{HelifxError, Result};
