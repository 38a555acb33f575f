//! Speed and acceleration limited servo motion
//!
//! Each tick maps the latest input pulse width linearly onto the output range
//! and moves the output toward that target. Velocity is bounded by
//! `max_speed_us_per_sec`, and its change per tick by `max_accel_us_per_sec2`.
//! With an acceleration limit the commanded velocity also stays under the
//! braking curve, so the output decelerates into the target instead of
//! overshooting it. Setting both limits to zero disables motion limiting and
//! the output follows the target directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HelifxError, Result};

/// Output snaps to the target once closer than this
pub const SETTLE_THRESHOLD_US: f64 = 1.0;

/// Inclusive pulse-width interval in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRange {
    pub min_us: i32,
    pub max_us: i32,
}

impl PulseRange {
    pub const fn new(min_us: i32, max_us: i32) -> Self {
        Self { min_us, max_us }
    }

    pub fn span(&self) -> f64 {
        f64::from(self.max_us) - f64::from(self.min_us)
    }

    pub fn midpoint(&self) -> f64 {
        (f64::from(self.min_us) + f64::from(self.max_us)) / 2.0
    }

    pub fn clamp(&self, value_us: f64) -> f64 {
        value_us.clamp(f64::from(self.min_us), f64::from(self.max_us))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.min_us >= self.max_us {
            return Err(HelifxError::InvalidArgument(format!(
                "{name} range {}-{} µs is empty or inverted",
                self.min_us, self.max_us
            )));
        }
        Ok(())
    }
}

/// Servo motion parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Peak output velocity; 0 means unlimited
    pub max_speed_us_per_sec: f64,
    /// Peak change of velocity; 0 means unlimited
    pub max_accel_us_per_sec2: f64,
    pub update_rate_hz: u32,
    pub input_range: PulseRange,
    pub output_range: PulseRange,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_speed_us_per_sec: 0.0,
            max_accel_us_per_sec2: 0.0,
            update_rate_hz: 50,
            input_range: PulseRange::new(1000, 2000),
            output_range: PulseRange::new(1000, 2000),
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<()> {
        self.input_range.validate("input")?;
        self.output_range.validate("output")?;
        if self.update_rate_hz == 0 {
            return Err(HelifxError::InvalidArgument(
                "update rate must be at least 1 Hz".to_string(),
            ));
        }
        for (name, value) in [
            ("max speed", self.max_speed_us_per_sec),
            ("max acceleration", self.max_accel_us_per_sec2),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(HelifxError::InvalidArgument(format!(
                    "{name} must be a finite value >= 0, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// True when neither speed nor acceleration is limited
    pub fn is_instant(&self) -> bool {
        self.max_speed_us_per_sec <= 0.0 && self.max_accel_us_per_sec2 <= 0.0
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.update_rate_hz.max(1)))
    }

    /// Linear input-to-output mapping, clamped to the output range
    pub fn map_input(&self, input_us: f64) -> f64 {
        let fraction = (input_us - f64::from(self.input_range.min_us)) / self.input_range.span();
        self.output_range
            .clamp(f64::from(self.output_range.min_us) + fraction * self.output_range.span())
    }

    /// Input width that maps onto `output_us`
    pub fn unmap_output(&self, output_us: f64) -> f64 {
        let fraction = (output_us - f64::from(self.output_range.min_us)) / self.output_range.span();
        f64::from(self.input_range.min_us) + fraction * self.input_range.span()
    }
}

/// Point-in-time view of a servo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSnapshot {
    pub input_us: f64,
    pub target_us: f64,
    pub output_us: f64,
    pub velocity_us_per_sec: f64,
}

impl MotionSnapshot {
    pub fn is_settled(&self) -> bool {
        (self.target_us - self.output_us).abs() < SETTLE_THRESHOLD_US
            && self.velocity_us_per_sec == 0.0
    }
}

/// Motion filter state advanced once per tick
#[derive(Debug, Clone)]
pub struct MotionState {
    config: MotionConfig,
    input_us: f64,
    target_us: f64,
    output_us: f64,
    velocity: f64,
}

impl MotionState {
    /// Starts at rest at the output midpoint, with the input at its midpoint
    pub fn new(config: MotionConfig) -> Result<Self> {
        config.validate()?;
        let output_us = config.output_range.midpoint();
        Ok(Self {
            config,
            input_us: config.input_range.midpoint(),
            target_us: output_us,
            output_us,
            velocity: 0.0,
        })
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Replaces the parameters; position and velocity carry over
    pub fn set_config(&mut self, config: MotionConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.target_us = config.map_input(self.input_us);
        Ok(())
    }

    /// Records the latest input width; the output reacts on the next tick
    pub fn set_input(&mut self, input_us: i32) {
        self.input_us = f64::from(input_us);
    }

    /// Places the servo at rest at `position_us` (clamped to the output range)
    ///
    /// The stored input is moved so the next target equals the new position.
    pub fn reset(&mut self, position_us: i32) {
        let position = self.config.output_range.clamp(f64::from(position_us));
        self.output_us = position;
        self.target_us = position;
        self.velocity = 0.0;
        self.input_us = self.config.unmap_output(position);
    }

    pub fn input_us(&self) -> f64 {
        self.input_us
    }

    pub fn target_us(&self) -> f64 {
        self.target_us
    }

    pub fn output_us(&self) -> f64 {
        self.output_us
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            input_us: self.input_us,
            target_us: self.target_us,
            output_us: self.output_us,
            velocity_us_per_sec: self.velocity,
        }
    }

    /// Advances the filter by one update period
    pub fn tick(&mut self) -> MotionSnapshot {
        let config = self.config;
        let dt = 1.0 / f64::from(config.update_rate_hz);
        self.target_us = config.map_input(self.input_us);
        let error = self.target_us - self.output_us;

        if config.is_instant() {
            self.output_us = self.target_us;
            self.velocity = 0.0;
            return self.snapshot();
        }

        let max_speed = config.max_speed_us_per_sec;
        let max_accel = config.max_accel_us_per_sec2;

        let mut desired = error / dt;
        if max_speed > 0.0 {
            desired = desired.clamp(-max_speed, max_speed);
        }

        let mut velocity = desired;
        if max_accel > 0.0 {
            let braking = braking_velocity(error.abs(), max_accel, dt);
            desired = desired.clamp(-braking, braking);
            let max_change = max_accel * dt;
            velocity = self.velocity + (desired - self.velocity).clamp(-max_change, max_change);
        }
        if max_speed > 0.0 {
            velocity = velocity.clamp(-max_speed, max_speed);
        }

        let step = velocity * dt;
        if error != 0.0 && step.signum() == error.signum() && step.abs() >= error.abs() {
            // this tick reaches the target
            self.output_us = self.target_us;
            self.velocity = 0.0;
        } else {
            self.output_us += step;
            self.velocity = velocity;
        }

        let (low, high) = (
            f64::from(config.output_range.min_us),
            f64::from(config.output_range.max_us),
        );
        if self.output_us >= high {
            self.output_us = high;
            self.velocity = self.velocity.min(0.0);
        } else if self.output_us <= low {
            self.output_us = low;
            self.velocity = self.velocity.max(0.0);
        }

        if (self.target_us - self.output_us).abs() < SETTLE_THRESHOLD_US {
            self.output_us = self.target_us;
            self.velocity = 0.0;
        }

        self.snapshot()
    }
}

/// Highest speed from which `distance` can still be covered without overshoot
///
/// Discrete form: a velocity of `n * accel * dt` needs
/// `accel * dt^2 * n * (n + 1) / 2` to come to rest when decelerating by
/// `accel * dt` per tick.
fn braking_velocity(distance: f64, accel: f64, dt: f64) -> f64 {
    let per_tick = accel * dt;
    let n = ((1.0 + 8.0 * distance / (per_tick * dt)).sqrt() - 1.0) / 2.0;
    n * per_tick
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited() -> MotionConfig {
        MotionConfig {
            max_speed_us_per_sec: 500.0,
            max_accel_us_per_sec2: 2000.0,
            update_rate_hz: 50,
            input_range: PulseRange::new(1000, 2000),
            output_range: PulseRange::new(800, 2200),
        }
    }

    #[test]
    fn default_config_is_instant_identity() {
        let config = MotionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_instant());
        assert_eq!(config.map_input(1234.0), 1234.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let inverted = MotionConfig {
            input_range: PulseRange::new(2000, 1000),
            ..MotionConfig::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(HelifxError::InvalidArgument(_))
        ));

        let zero_rate = MotionConfig {
            update_rate_hz: 0,
            ..MotionConfig::default()
        };
        assert!(zero_rate.validate().is_err());

        let negative_speed = MotionConfig {
            max_speed_us_per_sec: -1.0,
            ..MotionConfig::default()
        };
        assert!(negative_speed.validate().is_err());

        let nan_accel = MotionConfig {
            max_accel_us_per_sec2: f64::NAN,
            ..MotionConfig::default()
        };
        assert!(nan_accel.validate().is_err());
    }

    #[test]
    fn mapping_is_linear_and_clamped() {
        let config = limited();
        assert_eq!(config.map_input(1000.0), 800.0);
        assert_eq!(config.map_input(1500.0), 1500.0);
        assert_eq!(config.map_input(2000.0), 2200.0);
        assert_eq!(config.map_input(2500.0), 2200.0);
        assert_eq!(config.map_input(0.0), 800.0);
        assert_eq!(config.unmap_output(1850.0), 1750.0);
    }

    #[test]
    fn new_state_rests_at_midpoint() {
        let state = MotionState::new(limited()).unwrap();
        assert_eq!(state.output_us(), 1500.0);
        assert_eq!(state.input_us(), 1500.0);
        assert_eq!(state.velocity(), 0.0);
    }

    #[test]
    fn instant_mode_jumps_to_target() {
        let mut state = MotionState::new(MotionConfig {
            output_range: PulseRange::new(800, 2200),
            ..MotionConfig::default()
        })
        .unwrap();
        state.set_input(2000);
        let snapshot = state.tick();
        assert_eq!(snapshot.output_us, 2200.0);
        assert_eq!(snapshot.velocity_us_per_sec, 0.0);
    }

    #[test]
    fn speed_limit_caps_step_size() {
        let mut state = MotionState::new(MotionConfig {
            max_speed_us_per_sec: 500.0,
            max_accel_us_per_sec2: 0.0,
            ..limited()
        })
        .unwrap();
        state.set_input(2000);
        let first = state.tick();
        assert!((first.output_us - 1510.0).abs() < 1e-9);
        assert_eq!(first.velocity_us_per_sec, 500.0);
    }

    #[test]
    fn accel_limit_ramps_velocity() {
        let mut state = MotionState::new(limited()).unwrap();
        state.set_input(2000);
        let first = state.tick();
        let second = state.tick();
        assert!((first.velocity_us_per_sec - 40.0).abs() < 1e-9);
        assert!((second.velocity_us_per_sec - 80.0).abs() < 1e-9);
        assert!(second.output_us > first.output_us);
    }

    #[test]
    fn limited_motion_settles_without_overshoot() {
        let mut state = MotionState::new(limited()).unwrap();
        state.set_input(2000);
        let mut settled_at = None;
        for tick in 0..200 {
            let snapshot = state.tick();
            assert!(snapshot.output_us <= 2200.0);
            if snapshot.is_settled() {
                settled_at = Some(tick);
                break;
            }
        }
        assert_eq!(state.output_us(), 2200.0);
        assert!(settled_at.is_some_and(|t| t < 120));
    }

    #[test]
    fn reset_holds_position_on_next_tick() {
        let mut state = MotionState::new(limited()).unwrap();
        state.set_input(2000);
        for _ in 0..10 {
            state.tick();
        }
        state.reset(1850);
        assert_eq!(state.velocity(), 0.0);

        let snapshot = state.tick();
        assert!((snapshot.output_us - 1850.0).abs() < 1e-6);
        assert!((snapshot.target_us - 1850.0).abs() < 1e-6);
        assert_eq!(snapshot.velocity_us_per_sec, 0.0);
    }

    #[test]
    fn reset_is_clamped_to_output_range() {
        let mut state = MotionState::new(limited()).unwrap();
        state.reset(5000);
        assert_eq!(state.output_us(), 2200.0);
        state.reset(-40);
        assert_eq!(state.output_us(), 800.0);
    }

    #[test]
    fn config_swap_keeps_position() {
        let mut state = MotionState::new(limited()).unwrap();
        state.set_input(1800);
        for _ in 0..5 {
            state.tick();
        }
        let before = state.output_us();
        state
            .set_config(MotionConfig {
                max_speed_us_per_sec: 100.0,
                ..limited()
            })
            .unwrap();
        assert_eq!(state.output_us(), before);
        assert!(state
            .set_config(MotionConfig {
                update_rate_hz: 0,
                ..limited()
            })
            .is_err());
        assert_eq!(state.config().max_speed_us_per_sec, 100.0);
    }

    #[test]
    fn braking_velocity_matches_discrete_stop_distance() {
        let (accel, dt) = (2000.0, 0.02);
        // three decelerating ticks cover 0.8 * (3 + 2 + 1)
        let v = braking_velocity(4.8, accel, dt);
        assert!((v - 3.0 * accel * dt).abs() < 1e-9);
        assert_eq!(braking_velocity(0.0, accel, dt), 0.0);
    }
}
