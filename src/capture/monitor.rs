use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::capture::registry::RegistryShared;
use crate::capture::sample_ring::{Sample, SampleRing};
use crate::error::{HelifxError, Result};
use crate::gpio::{Edge, EdgeEvent, EdgeSource, LineBackend};

/// Shortest pulse accepted as an RC signal
pub const MIN_PLAUSIBLE_PULSE_US: u32 = 500;
/// Longest pulse accepted as an RC signal
pub const MAX_PLAUSIBLE_PULSE_US: u32 = 3000;

/// Shortest averaging window [`Monitor::set_average_window`] applies
pub const MIN_AVERAGE_WINDOW: Duration = Duration::from_millis(10);
/// Longest averaging window [`Monitor::set_average_window`] applies
pub const MAX_AVERAGE_WINDOW: Duration = Duration::from_secs(5);

const READING_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A measured high-time on one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PulseReading {
    pub line_id: u8,
    pub duration_us: u32,
}

/// Receives every accepted pulse
///
/// Called from the capture worker thread after the monitor's state lock has
/// been released. Observers must not stop monitors of the same registry.
pub trait PulseObserver: Send + Sync {
    fn on_pulse(&self, reading: PulseReading);
}

impl<F> PulseObserver for F
where
    F: Fn(PulseReading) + Send + Sync,
{
    fn on_pulse(&self, reading: PulseReading) {
        self(reading)
    }
}

/// Per-monitor edge accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub accepted: u64,
    pub implausible: u64,
    pub unmatched_falls: u64,
    pub last_accepted_us: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeOutcome {
    Armed,
    Pulse(PulseReading),
    Implausible { width_us: u64 },
    Unmatched,
}

/// Edge pairing state plus published results
#[derive(Debug)]
pub(crate) struct MonitorState {
    awaiting_fall: bool,
    rise_timestamp_ns: u64,
    latest: Option<PulseReading>,
    unconsumed: bool,
    first_signal_seen: bool,
    average_window: Duration,
    samples: SampleRing,
    stats: MonitorStats,
}

impl MonitorState {
    pub(crate) fn new(sample_capacity: usize, average_window: Duration) -> Self {
        Self {
            awaiting_fall: false,
            rise_timestamp_ns: 0,
            latest: None,
            unconsumed: false,
            first_signal_seen: false,
            average_window: clamp_window(average_window),
            samples: SampleRing::with_capacity(sample_capacity),
            stats: MonitorStats::default(),
        }
    }

    pub(crate) fn apply_edge(&mut self, line_id: u8, event: EdgeEvent, now: Instant) -> EdgeOutcome {
        match event.edge {
            Edge::Rising => {
                self.rise_timestamp_ns = event.timestamp_ns;
                self.awaiting_fall = true;
                EdgeOutcome::Armed
            }
            Edge::Falling if self.awaiting_fall => {
                self.awaiting_fall = false;
                let width_us = event
                    .timestamp_ns
                    .checked_sub(self.rise_timestamp_ns)
                    .map_or(0, |ns| ns / 1_000);

                let band = u64::from(MIN_PLAUSIBLE_PULSE_US)..=u64::from(MAX_PLAUSIBLE_PULSE_US);
                let Some(duration_us) = band
                    .contains(&width_us)
                    .then(|| u32::try_from(width_us).ok())
                    .flatten()
                else {
                    self.stats.implausible += 1;
                    return EdgeOutcome::Implausible { width_us };
                };

                let reading = PulseReading {
                    line_id,
                    duration_us,
                };
                self.latest = Some(reading);
                self.unconsumed = true;
                self.samples.push(Sample {
                    at: now,
                    duration_us,
                });
                self.stats.accepted += 1;
                self.stats.last_accepted_us = Some(duration_us);
                EdgeOutcome::Pulse(reading)
            }
            Edge::Falling => {
                self.stats.unmatched_falls += 1;
                EdgeOutcome::Unmatched
            }
        }
    }

    /// Forgets a half-seen pulse
    pub(crate) fn disarm(&mut self) {
        self.awaiting_fall = false;
    }

    fn take_unconsumed(&mut self) -> Option<PulseReading> {
        if self.unconsumed {
            self.unconsumed = false;
            self.latest
        } else {
            None
        }
    }

    fn average_at(&self, now: Instant) -> Option<u32> {
        self.samples.mean_within(self.average_window, now)
    }
}

fn clamp_window(window: Duration) -> Duration {
    window.clamp(MIN_AVERAGE_WINDOW, MAX_AVERAGE_WINDOW)
}

/// Monitor data shared with the capture worker
pub(crate) struct MonitorShared<S> {
    pub(crate) line_id: u8,
    pub(crate) label: Option<String>,
    pub(crate) source: S,
    state: Mutex<MonitorState>,
    observer: Option<Arc<dyn PulseObserver>>,
    pub(crate) active: AtomicBool,
    pub(crate) orphaned: AtomicBool,
}

impl<S: EdgeSource> MonitorShared<S> {
    /// Drops edges queued while the monitor was stopped
    pub(crate) fn discard_pending(&self) {
        let mut stale = Vec::new();
        if let Err(e) = self.source.read_edges(&mut stale) {
            debug!("Could not flush stale edges on line {}: {}", self.line_id, e);
        }
        self.state.lock().disarm();
        if !stale.is_empty() {
            debug!(
                "Discarded {} edges queued on {} while stopped",
                stale.len(),
                self.display_name()
            );
        }
    }
}

impl<S> MonitorShared<S> {
    pub(crate) fn new(
        line_id: u8,
        label: Option<String>,
        source: S,
        state: MonitorState,
        observer: Option<Arc<dyn PulseObserver>>,
    ) -> Self {
        Self {
            line_id,
            label,
            source,
            state: Mutex::new(state),
            observer,
            active: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
        }
    }

    pub(crate) fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{} (line {})", label, self.line_id),
            None => format!("line {}", self.line_id),
        }
    }

    /// Feeds one edge through the pairing logic and notifies the observer
    pub(crate) fn process_edge(&self, event: EdgeEvent) -> Option<PulseReading> {
        let (outcome, first_signal) = {
            let mut state = self.state.lock();
            let outcome = state.apply_edge(self.line_id, event, Instant::now());
            let first_signal = matches!(outcome, EdgeOutcome::Pulse(_))
                && !std::mem::replace(&mut state.first_signal_seen, true);
            (outcome, first_signal)
        };

        match outcome {
            EdgeOutcome::Pulse(reading) => {
                if first_signal {
                    info!(
                        "First PWM signal on {}: {} µs",
                        self.display_name(),
                        reading.duration_us
                    );
                }
                trace!("Pulse on line {}: {} µs", self.line_id, reading.duration_us);
                if let Some(observer) = &self.observer {
                    observer.on_pulse(reading);
                }
                Some(reading)
            }
            EdgeOutcome::Implausible { width_us } => {
                debug!(
                    "Dropping implausible pulse on line {}: {} µs",
                    self.line_id, width_us
                );
                None
            }
            EdgeOutcome::Unmatched => {
                trace!("Ignoring falling edge without rise on line {}", self.line_id);
                None
            }
            EdgeOutcome::Armed => None,
        }
    }
}

/// PWM pulse-width monitor for one line
///
/// Created by [`crate::capture::CaptureRegistry::create_monitor`]. While
/// started, the registry's shared capture worker pairs its edges into
/// [`PulseReading`]s. Dropping the monitor stops it and releases the line.
pub struct Monitor<B: LineBackend> {
    shared: Arc<MonitorShared<B::Source>>,
    registry: Arc<RegistryShared<B>>,
}

impl<B: LineBackend> Monitor<B> {
    pub(crate) fn new(shared: Arc<MonitorShared<B::Source>>, registry: Arc<RegistryShared<B>>) -> Self {
        Self { shared, registry }
    }

    pub fn line_id(&self) -> u8 {
        self.shared.line_id
    }

    pub fn label(&self) -> Option<&str> {
        self.shared.label.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Adds the monitor to the active set, spawning the capture worker if needed
    ///
    /// Starting a running monitor is a no-op.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when every active slot is taken or the worker thread
    /// cannot be spawned; `NotReady` after the registry was shut down.
    pub fn start(&self) -> Result<()> {
        self.registry.activate(&self.shared)
    }

    /// Removes the monitor from the active set
    ///
    /// Returns once the capture worker has let go of the monitor: no reading is
    /// produced for it afterwards. When it was the last active monitor, the
    /// worker has also exited. Stopping a stopped monitor is a no-op.
    pub fn stop(&self) {
        self.registry.deactivate(&self.shared);
    }

    /// Most recent reading not yet returned by this method
    pub fn latest_reading(&self) -> Result<Option<PulseReading>> {
        self.ensure_attached()?;
        Ok(self.shared.state.lock().take_unconsumed())
    }

    /// Polls for an unconsumed reading until `timeout` elapses
    ///
    /// A zero timeout checks exactly once.
    pub fn wait_for_reading(&self, timeout: Duration) -> Result<Option<PulseReading>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reading) = self.latest_reading()? {
                return Ok(Some(reading));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(READING_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Mean pulse width over the averaging window, in microseconds
    pub fn average_us(&self) -> Result<Option<u32>> {
        self.ensure_attached()?;
        Ok(self.shared.state.lock().average_at(Instant::now()))
    }

    /// Sets the averaging window, clamped to 10 ms..=5 s
    ///
    /// Returns the window actually applied.
    pub fn set_average_window(&self, window: Duration) -> Duration {
        let applied = clamp_window(window);
        self.shared.state.lock().average_window = applied;
        debug!(
            "Averaging window for {} set to {:?}",
            self.shared.display_name(),
            applied
        );
        applied
    }

    pub fn average_window(&self) -> Duration {
        self.shared.state.lock().average_window
    }

    pub fn stats(&self) -> MonitorStats {
        self.shared.state.lock().stats
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.shared.orphaned.load(Ordering::Acquire) {
            return Err(HelifxError::NotReady(format!(
                "capture worker for {} has exited",
                self.shared.display_name()
            )));
        }
        Ok(())
    }
}

impl<B: LineBackend> fmt::Debug for Monitor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("line_id", &self.shared.line_id)
            .field("label", &self.shared.label)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<B: LineBackend> Drop for Monitor<B> {
    fn drop(&mut self) {
        self.stop();
        debug!("PWM monitor for {} destroyed", self.shared.display_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: u8 = 17;

    fn state() -> MonitorState {
        MonitorState::new(128, Duration::from_millis(200))
    }

    fn pulse(state: &mut MonitorState, rise_ns: u64, width_us: u64) -> EdgeOutcome {
        let now = Instant::now();
        state.apply_edge(LINE, EdgeEvent::rising(rise_ns), now);
        state.apply_edge(LINE, EdgeEvent::falling(rise_ns + width_us * 1_000), now)
    }

    #[test]
    fn rising_then_falling_yields_reading() {
        let mut state = state();
        let outcome = pulse(&mut state, 1_000_000, 1500);
        assert_eq!(
            outcome,
            EdgeOutcome::Pulse(PulseReading {
                line_id: LINE,
                duration_us: 1500
            })
        );
        assert_eq!(state.take_unconsumed().map(|r| r.duration_us), Some(1500));
        assert_eq!(state.take_unconsumed(), None);
    }

    #[test]
    fn disarm_drops_half_seen_pulse() {
        let mut state = state();
        let now = Instant::now();
        state.apply_edge(LINE, EdgeEvent::rising(0), now);
        state.disarm();
        assert_eq!(
            state.apply_edge(LINE, EdgeEvent::falling(1_500_000), now),
            EdgeOutcome::Unmatched
        );
        assert_eq!(state.stats.unmatched_falls, 1);
    }

    #[test]
    fn band_limits_are_inclusive() {
        let mut state = state();
        assert!(matches!(pulse(&mut state, 0, 500), EdgeOutcome::Pulse(_)));
        assert!(matches!(pulse(&mut state, 0, 3000), EdgeOutcome::Pulse(_)));
        assert_eq!(
            pulse(&mut state, 0, 499),
            EdgeOutcome::Implausible { width_us: 499 }
        );
        assert_eq!(
            pulse(&mut state, 0, 3001),
            EdgeOutcome::Implausible { width_us: 3001 }
        );
        assert_eq!(state.stats.accepted, 2);
        assert_eq!(state.stats.implausible, 2);
    }

    #[test]
    fn implausible_pulse_keeps_previous_reading() {
        let mut state = state();
        pulse(&mut state, 0, 1200);
        pulse(&mut state, 30_000_000, 50);
        assert_eq!(state.take_unconsumed().map(|r| r.duration_us), Some(1200));
        assert_eq!(state.stats.last_accepted_us, Some(1200));
    }

    #[test]
    fn falling_edge_without_rise_is_ignored() {
        let mut state = state();
        let outcome = state.apply_edge(LINE, EdgeEvent::falling(5_000), Instant::now());
        assert_eq!(outcome, EdgeOutcome::Unmatched);
        assert_eq!(state.take_unconsumed(), None);
        assert_eq!(state.stats.unmatched_falls, 1);
    }

    #[test]
    fn second_rise_restarts_measurement() {
        let mut state = state();
        let now = Instant::now();
        state.apply_edge(LINE, EdgeEvent::rising(0), now);
        state.apply_edge(LINE, EdgeEvent::rising(10_000_000), now);
        let outcome = state.apply_edge(LINE, EdgeEvent::falling(11_600_000), now);
        assert!(matches!(
            outcome,
            EdgeOutcome::Pulse(PulseReading {
                duration_us: 1600,
                ..
            })
        ));
    }

    #[test]
    fn fall_before_rise_timestamp_is_implausible() {
        let mut state = state();
        let now = Instant::now();
        state.apply_edge(LINE, EdgeEvent::rising(5_000_000), now);
        let outcome = state.apply_edge(LINE, EdgeEvent::falling(4_000_000), now);
        assert_eq!(outcome, EdgeOutcome::Implausible { width_us: 0 });
    }

    #[test]
    fn window_is_clamped() {
        assert_eq!(clamp_window(Duration::from_millis(1)), MIN_AVERAGE_WINDOW);
        assert_eq!(clamp_window(Duration::from_secs(60)), MAX_AVERAGE_WINDOW);
        assert_eq!(
            clamp_window(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn average_covers_recent_readings() {
        let mut state = state();
        pulse(&mut state, 0, 1000);
        pulse(&mut state, 20_000_000, 2000);
        assert_eq!(state.average_at(Instant::now()), Some(1500));
    }
}
