//! Wiring between capture monitors and servos
//!
//! A [`ChannelLink`] forwards one receiver channel into one servo at the servo's
//! update rate. The [`StatusReporter`] periodically logs what every channel is
//! doing. Both run as tokio tasks and stop when their cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::Monitor;
use crate::error::{HelifxError, Result};
use crate::gpio::LineBackend;
use crate::servo::Servo;

/// Which monitor value feeds the servo
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Each new reading as it arrives
    #[default]
    Latest,
    /// The sliding-window mean
    Average,
}

/// Forwards one monitor into one servo
pub struct ChannelLink<B: LineBackend> {
    name: String,
    monitor: Arc<Monitor<B>>,
    servo: Arc<Servo>,
    mode: InputMode,
}

impl<B: LineBackend> ChannelLink<B> {
    pub fn new(name: &str, monitor: Arc<Monitor<B>>, servo: Arc<Servo>, mode: InputMode) -> Self {
        Self {
            name: name.to_string(),
            monitor,
            servo,
            mode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pushes the current monitor value into the servo
    ///
    /// Returns the forwarded width, or `None` when there was nothing new.
    pub fn forward_once(&self) -> Result<Option<u32>> {
        let width = match self.mode {
            InputMode::Latest => self.monitor.latest_reading()?.map(|r| r.duration_us),
            InputMode::Average => self.monitor.average_us()?,
        };
        if let Some(width) = width {
            self.servo.set_input(i32::try_from(width).unwrap_or(i32::MAX));
        }
        Ok(width)
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.servo.config().tick_period();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "Channel [{}] linked: line {} -> servo every {:?} ({:?})",
                self.name,
                self.monitor.line_id(),
                period,
                self.mode
            );

            let mut forwarded: u64 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match self.forward_once() {
                            Ok(Some(_)) => forwarded += 1,
                            Ok(None) => {}
                            Err(HelifxError::NotReady(reason)) => {
                                error!("Channel [{}] lost its input: {}", self.name, reason);
                                break;
                            }
                            Err(e) => warn!("Channel [{}] forward failed: {}", self.name, e),
                        }
                    }
                }
            }
            info!(
                "Channel [{}] unlinked after forwarding {} readings",
                self.name, forwarded
            );
        })
    }
}

struct ChannelStatus<B: LineBackend> {
    name: String,
    monitor: Arc<Monitor<B>>,
    servo: Option<Arc<Servo>>,
}

/// Periodic one-line summary per channel
pub struct StatusReporter<B: LineBackend> {
    channels: Vec<ChannelStatus<B>>,
    interval: Duration,
}

impl<B: LineBackend> StatusReporter<B> {
    pub fn new(interval: Duration) -> Self {
        Self {
            channels: Vec::new(),
            interval,
        }
    }

    pub fn add_channel(&mut self, name: &str, monitor: Arc<Monitor<B>>, servo: Option<Arc<Servo>>) {
        self.channels.push(ChannelStatus {
            name: name.to_string(),
            monitor,
            servo,
        });
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Renders the current state of every channel; does not consume readings
    pub fn status_lines(&self) -> Vec<String> {
        let stamp = Local::now().format("%H:%M:%S%.3f");
        self.channels
            .iter()
            .map(|channel| {
                let stats = channel.monitor.stats();
                let input = stats
                    .last_accepted_us
                    .map_or_else(|| "----".to_string(), |us| us.to_string());
                let servo = channel.servo.as_ref().map_or_else(String::new, |servo| {
                    let snapshot = servo.snapshot();
                    format!(
                        " | target {:>4.0} µs output {:>4.0} µs velocity {:>7.1} µs/s",
                        snapshot.target_us, snapshot.output_us, snapshot.velocity_us_per_sec
                    )
                });
                format!(
                    "[{}] {:<10} line {:>2} input {:>4} µs ({} ok, {} dropped){}",
                    stamp,
                    channel.name,
                    channel.monitor.line_id(),
                    input,
                    stats.accepted,
                    stats.implausible,
                    servo
                )
            })
            .collect()
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.interval.is_zero() {
                debug!("Status reporting disabled");
                token.cancelled().await;
                return;
            }
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        for line in self.status_lines() {
                            info!("{}", line);
                        }
                    }
                }
            }
            debug!("Status reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureRegistry;
    use crate::gpio::SimulatedLines;
    use crate::servo::MotionConfig;

    #[test]
    fn input_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: InputMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"average\"").unwrap();
        assert_eq!(parsed.mode, InputMode::Average);
        assert_eq!(InputMode::default(), InputMode::Latest);
    }

    #[test]
    fn forward_once_passes_latest_reading() {
        let lines = SimulatedLines::new();
        let registry = CaptureRegistry::new(lines.clone());
        let monitor = Arc::new(registry.create_monitor(17, Some("turret")).unwrap());
        monitor.start().unwrap();
        let servo = Arc::new(Servo::create(MotionConfig::default()).unwrap());
        let link = ChannelLink::new("turret", Arc::clone(&monitor), Arc::clone(&servo), InputMode::Latest);

        assert_eq!(link.forward_once().unwrap(), None);

        lines.inject_pulse(17, 1750);
        let reading = monitor.wait_for_reading(Duration::from_secs(2)).unwrap();
        assert_eq!(reading.map(|r| r.duration_us), Some(1750));

        // the reading above was consumed, inject a fresh one for the link
        lines.inject_pulse(17, 1760);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut forwarded = None;
        while forwarded.is_none() && std::time::Instant::now() < deadline {
            forwarded = link.forward_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(forwarded, Some(1760));
        assert_eq!(link.name(), "turret");
    }

    #[test]
    fn status_lines_show_every_channel() {
        let lines = SimulatedLines::new();
        let registry = CaptureRegistry::new(lines);
        let monitor = Arc::new(registry.create_monitor(22, None).unwrap());
        let mut reporter = StatusReporter::new(Duration::from_secs(1));
        reporter.add_channel("smoke", monitor, None);

        let status = reporter.status_lines();
        assert_eq!(reporter.channel_count(), 1);
        assert_eq!(status.len(), 1);
        assert!(status[0].contains("smoke"));
        assert!(status[0].contains("----"));
    }

    #[tokio::test]
    async fn link_task_stops_on_cancel() {
        let registry = CaptureRegistry::new(SimulatedLines::new());
        let monitor = Arc::new(registry.create_monitor(23, None).unwrap());
        let servo = Arc::new(Servo::create(MotionConfig::default()).unwrap());
        let token = CancellationToken::new();
        let task = ChannelLink::new("bay", monitor, servo, InputMode::Average).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("link task did not stop")
            .expect("link task panicked");
    }
}
