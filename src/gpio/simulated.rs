//! In-memory GPIO backend
//!
//! Lines live in a shared table guarded by one mutex. Edge subscribers get a
//! queue each; injected edges are appended to the queue and wake any thread
//! blocked in [`LineBackend::wait_ready`]. Timestamps come from a virtual
//! nanosecond clock that only moves when a test (or the sweep generator)
//! advances it, so pulse widths are exact.
//!
//! Fault injection covers the failure paths the capture worker has to survive:
//! refused subscriptions, one-shot drain failures and a readiness wait that
//! can no longer be re-armed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::{check_line, Direction, Edge, EdgeEvent, EdgeSource, HardwareError, LineBackend, Pull};

/// Frame length of a standard 50 Hz RC signal
pub const RC_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
struct SimLine {
    direction: Direction,
    high: bool,
}

#[derive(Debug)]
struct Subscription {
    id: u64,
    queue: VecDeque<EdgeEvent>,
}

#[derive(Debug, Default)]
struct SimTable {
    clock_ns: u64,
    lines: HashMap<u8, SimLine>,
    subscriptions: HashMap<u8, Subscription>,
    refused: HashSet<u8>,
    failing_drains: HashSet<u8>,
    pulls: HashMap<u8, Pull>,
    wait_broken: bool,
    wake_pending: bool,
}

#[derive(Debug, Default)]
struct SimShared {
    table: Mutex<SimTable>,
    edges_ready: Condvar,
    next_subscription: AtomicU64,
}

/// Simulated line backend
///
/// Cheap to clone; every clone drives the same set of lines.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLines {
    shared: Arc<SimShared>,
}

impl SimulatedLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in nanoseconds
    pub fn now_ns(&self) -> u64 {
        self.shared.table.lock().clock_ns
    }

    pub fn advance(&self, by: Duration) {
        let mut table = self.shared.table.lock();
        table.clock_ns = table.clock_ns.saturating_add(duration_ns(by));
    }

    /// Queues one edge stamped with the current virtual time
    ///
    /// Returns false when nobody is subscribed to `line_id`.
    pub fn inject_edge(&self, line_id: u8, edge: Edge) -> bool {
        let now = self.now_ns();
        self.inject_edge_at(line_id, edge, now)
    }

    /// Queues one edge with an explicit timestamp
    pub fn inject_edge_at(&self, line_id: u8, edge: Edge, timestamp_ns: u64) -> bool {
        self.inject_edges(line_id, &[EdgeEvent { edge, timestamp_ns }])
    }

    /// Queues a complete pulse of `width_us` and advances the clock by one frame
    ///
    /// Both edges are queued atomically, so a reader never sees the rising edge
    /// without its falling edge.
    pub fn inject_pulse(&self, line_id: u8, width_us: u64) -> bool {
        let start = {
            let mut table = self.shared.table.lock();
            let start = table.clock_ns;
            let frame = duration_ns(RC_FRAME).max(width_us.saturating_mul(1_000) + 1);
            table.clock_ns = start.saturating_add(frame);
            start
        };
        let fall = start.saturating_add(width_us.saturating_mul(1_000));
        self.inject_edges(
            line_id,
            &[EdgeEvent::rising(start), EdgeEvent::falling(fall)],
        )
    }

    fn inject_edges(&self, line_id: u8, edges: &[EdgeEvent]) -> bool {
        let mut table = self.shared.table.lock();
        let Some(subscription) = table.subscriptions.get_mut(&line_id) else {
            return false;
        };
        subscription.queue.extend(edges.iter().copied());
        drop(table);
        self.shared.edges_ready.notify_all();
        true
    }

    /// Drives an input line level for [`LineBackend::read_line`]
    pub fn set_input_level(&self, line_id: u8, high: bool) {
        if let Some(line) = self.shared.table.lock().lines.get_mut(&line_id) {
            if line.direction == Direction::Input {
                line.high = high;
            }
        }
    }

    /// Level last written to an output line
    pub fn output_level(&self, line_id: u8) -> Option<bool> {
        self.shared
            .table
            .lock()
            .lines
            .get(&line_id)
            .filter(|line| line.direction == Direction::Output)
            .map(|line| line.high)
    }

    /// Bias last set on `line_id`
    pub fn pull(&self, line_id: u8) -> Pull {
        self.shared
            .table
            .lock()
            .pulls
            .get(&line_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, line_id: u8) -> bool {
        self.shared.table.lock().subscriptions.contains_key(&line_id)
    }

    pub fn pending_edges(&self, line_id: u8) -> usize {
        self.shared
            .table
            .lock()
            .subscriptions
            .get(&line_id)
            .map_or(0, |s| s.queue.len())
    }

    /// Makes every future subscription on `line_id` fail
    pub fn refuse_subscriptions(&self, line_id: u8) {
        self.shared.table.lock().refused.insert(line_id);
    }

    /// Makes the next drain of `line_id` fail once, discarding its queued edges
    pub fn fail_next_drain(&self, line_id: u8) {
        self.shared.table.lock().failing_drains.insert(line_id);
    }

    /// Breaks the readiness wait until [`SimulatedLines::repair_readiness`]
    pub fn break_readiness(&self) {
        self.shared.table.lock().wait_broken = true;
        self.shared.edges_ready.notify_all();
    }

    pub fn repair_readiness(&self) {
        self.shared.table.lock().wait_broken = false;
    }

    /// Starts a background pulse generator on `line_id`
    ///
    /// Walks the pulse width back and forth between the configured limits,
    /// like a transmitter stick being swept end to end.
    pub fn spawn_sweep(&self, line_id: u8, settings: SweepSettings) -> SweepHandle {
        let lines = self.clone();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("pwm-sweep-{line_id}"))
            .spawn(move || {
                info!(
                    "Pulse sweep started on line {} ({}-{} µs, {} µs steps)",
                    line_id, settings.min_us, settings.max_us, settings.step_us
                );
                let mut width = settings.min_us;
                let mut rising = true;
                loop {
                    match stop_rx.recv_timeout(settings.frame) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    lines.inject_pulse(line_id, width);
                    (width, rising) = settings.next_width(width, rising);
                }
                info!("Pulse sweep stopped on line {}", line_id);
            });

        match handle {
            Ok(handle) => SweepHandle {
                stop: Some(stop_tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Failed to spawn pulse sweep on line {}: {}", line_id, e);
                SweepHandle {
                    stop: None,
                    handle: None,
                }
            }
        }
    }
}

/// Sweep generator parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub min_us: u64,
    pub max_us: u64,
    pub step_us: u64,
    pub frame: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            min_us: 1000,
            max_us: 2000,
            step_us: 10,
            frame: RC_FRAME,
        }
    }
}

impl SweepSettings {
    fn next_width(&self, width: u64, rising: bool) -> (u64, bool) {
        if rising {
            let next = width.saturating_add(self.step_us);
            if next >= self.max_us {
                (self.max_us, false)
            } else {
                (next, true)
            }
        } else {
            let next = width.saturating_sub(self.step_us);
            if next <= self.min_us {
                (self.min_us, true)
            } else {
                (next, false)
            }
        }
    }
}

/// Running sweep generator; stops and joins on drop
#[derive(Debug)]
pub struct SweepHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Pulse sweep thread panicked");
            }
        }
    }
}

/// Edge subscription on a simulated line
#[derive(Debug)]
pub struct SimulatedSource {
    line_id: u8,
    id: u64,
    shared: Arc<SimShared>,
}

impl EdgeSource for SimulatedSource {
    fn line_id(&self) -> u8 {
        self.line_id
    }

    fn read_edges(&self, out: &mut Vec<EdgeEvent>) -> Result<(), HardwareError> {
        let mut table = self.shared.table.lock();
        let failing = table.failing_drains.remove(&self.line_id);
        let Some(subscription) = table
            .subscriptions
            .get_mut(&self.line_id)
            .filter(|s| s.id == self.id)
        else {
            return Ok(());
        };
        if failing {
            subscription.queue.clear();
            return Err(HardwareError::EdgeSource(format!(
                "simulated drain failure on line {}",
                self.line_id
            )));
        }
        out.extend(subscription.queue.drain(..));
        Ok(())
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        let mut table = self.shared.table.lock();
        if table
            .subscriptions
            .get(&self.line_id)
            .is_some_and(|s| s.id == self.id)
        {
            table.subscriptions.remove(&self.line_id);
            debug!("Released simulated edge subscription on line {}", self.line_id);
        }
    }
}

impl LineBackend for SimulatedLines {
    type Source = SimulatedSource;

    fn configure_line(&self, line_id: u8, direction: Direction) -> Result<(), HardwareError> {
        check_line(line_id)?;
        let mut table = self.shared.table.lock();
        if table.subscriptions.contains_key(&line_id) {
            return Err(HardwareError::LineBusy(line_id));
        }
        // an undriven input floats to its pull-up
        let high = direction == Direction::Input && table.pulls.get(&line_id) == Some(&Pull::Up);
        table.lines.insert(line_id, SimLine { direction, high });
        Ok(())
    }

    fn write_line(&self, line_id: u8, high: bool) -> Result<(), HardwareError> {
        match self.shared.table.lock().lines.get_mut(&line_id) {
            Some(line) if line.direction == Direction::Output => {
                line.high = high;
                Ok(())
            }
            Some(_) => Err(HardwareError::WrongDirection(line_id, Direction::Output)),
            None => Err(HardwareError::NotConfigured(line_id)),
        }
    }

    fn read_line(&self, line_id: u8) -> Result<bool, HardwareError> {
        self.shared
            .table
            .lock()
            .lines
            .get(&line_id)
            .map(|line| line.high)
            .ok_or(HardwareError::NotConfigured(line_id))
    }

    fn set_pull(&self, line_id: u8, pull: Pull) -> Result<(), HardwareError> {
        check_line(line_id)?;
        let mut table = self.shared.table.lock();
        match table.lines.get_mut(&line_id) {
            Some(line) if line.direction == Direction::Output => {
                return Err(HardwareError::WrongDirection(line_id, Direction::Input));
            }
            Some(line) => line.high = pull == Pull::Up,
            None => {}
        }
        table.pulls.insert(line_id, pull);
        Ok(())
    }

    fn subscribe_edges(&self, line_id: u8) -> Result<SimulatedSource, HardwareError> {
        check_line(line_id)?;
        let mut table = self.shared.table.lock();
        if table.refused.contains(&line_id) {
            return Err(HardwareError::EdgeSource(format!(
                "simulated subscription failure on line {line_id}"
            )));
        }
        if table.subscriptions.contains_key(&line_id) || table.lines.contains_key(&line_id) {
            return Err(HardwareError::LineBusy(line_id));
        }

        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        table.subscriptions.insert(
            line_id,
            Subscription {
                id,
                queue: VecDeque::new(),
            },
        );
        debug!("Simulated edge subscription {} on line {}", id, line_id);

        Ok(SimulatedSource {
            line_id,
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn wait_ready(
        &self,
        sources: &[&SimulatedSource],
        timeout: Duration,
    ) -> Result<Vec<usize>, HardwareError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table.lock();
        loop {
            if table.wait_broken {
                return Err(HardwareError::EdgeSource(
                    "simulated readiness wait failure".to_string(),
                ));
            }
            if std::mem::take(&mut table.wake_pending) {
                return Ok(Vec::new());
            }

            let ready: Vec<usize> = sources
                .iter()
                .enumerate()
                .filter(|(_, source)| {
                    table
                        .subscriptions
                        .get(&source.line_id)
                        .is_some_and(|s| s.id == source.id && !s.queue.is_empty())
                })
                .map(|(index, _)| index)
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }

            if self
                .shared
                .edges_ready
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return Ok(Vec::new());
            }
        }
    }

    fn wake(&self) {
        self.shared.table.lock().wake_pending = true;
        self.shared.edges_ready.notify_all();
    }
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lines_track_written_level() {
        let lines = SimulatedLines::new();
        lines.configure_line(17, Direction::Output).unwrap();
        assert_eq!(lines.output_level(17), Some(false));

        lines.write_line(17, true).unwrap();
        assert_eq!(lines.output_level(17), Some(true));
        assert!(lines.read_line(17).unwrap());
    }

    #[test]
    fn writing_an_input_line_is_rejected() {
        let lines = SimulatedLines::new();
        lines.configure_line(22, Direction::Input).unwrap();
        assert!(matches!(
            lines.write_line(22, true),
            Err(HardwareError::WrongDirection(22, Direction::Output))
        ));

        lines.set_input_level(22, true);
        assert!(lines.read_line(22).unwrap());
        assert!(matches!(
            lines.read_line(23),
            Err(HardwareError::NotConfigured(23))
        ));
    }

    #[test]
    fn pulse_edges_carry_exact_width() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(17).unwrap();
        assert!(lines.inject_pulse(17, 1500));

        let mut edges = Vec::new();
        source.read_edges(&mut edges).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].edge, Edge::Rising);
        assert_eq!(edges[1].edge, Edge::Falling);
        assert_eq!(edges[1].timestamp_ns - edges[0].timestamp_ns, 1_500_000);
        assert_eq!(lines.now_ns(), 20_000_000);
    }

    #[test]
    fn second_subscription_on_same_line_is_busy() {
        let lines = SimulatedLines::new();
        let _first = lines.subscribe_edges(5).unwrap();
        assert!(matches!(
            lines.subscribe_edges(5),
            Err(HardwareError::LineBusy(5))
        ));
    }

    #[test]
    fn dropping_source_releases_line() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(6).unwrap();
        assert!(lines.is_subscribed(6));
        drop(source);
        assert!(!lines.is_subscribed(6));
        assert!(!lines.inject_edge(6, Edge::Rising));
        assert!(lines.subscribe_edges(6).is_ok());
    }

    #[test]
    fn wait_ready_times_out_without_edges() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(12).unwrap();
        let started = Instant::now();
        let ready = lines
            .wait_ready(&[&source], Duration::from_millis(20))
            .unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_ready_reports_only_readable_sources() {
        let lines = SimulatedLines::new();
        let a = lines.subscribe_edges(12).unwrap();
        let b = lines.subscribe_edges(13).unwrap();
        lines.inject_edge(13, Edge::Rising);

        let ready = lines
            .wait_ready(&[&a, &b], Duration::from_millis(100))
            .unwrap();
        assert_eq!(ready, vec![1]);
    }

    #[test]
    fn wait_ready_wakes_on_injection_from_another_thread() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(16).unwrap();
        let injector = {
            let lines = lines.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lines.inject_pulse(16, 1200);
            })
        };

        let ready = lines.wait_ready(&[&source], Duration::from_secs(2)).unwrap();
        injector.join().unwrap();
        assert_eq!(ready, vec![0]);
    }

    #[test]
    fn wake_cuts_readiness_wait_short() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(16).unwrap();
        let waker = {
            let lines = lines.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lines.wake();
            })
        };

        let started = Instant::now();
        let ready = lines.wait_ready(&[&source], Duration::from_secs(5)).unwrap();
        waker.join().unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));

        // the wake request is consumed by the wait it cut short
        let started = Instant::now();
        lines.wait_ready(&[&source], Duration::from_millis(30)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pull_up_sets_idle_input_level() {
        let lines = SimulatedLines::new();
        lines.set_pull(17, Pull::Up).unwrap();
        lines.configure_line(17, Direction::Input).unwrap();
        assert!(lines.read_line(17).unwrap());

        lines.set_pull(17, Pull::Down).unwrap();
        assert!(!lines.read_line(17).unwrap());
        assert_eq!(lines.pull(17), Pull::Down);

        lines.configure_line(22, Direction::Output).unwrap();
        assert!(matches!(
            lines.set_pull(22, Pull::Up),
            Err(HardwareError::WrongDirection(22, Direction::Input))
        ));
        assert_eq!(lines.pull(22), Pull::Off);
    }

    #[test]
    fn failing_drain_discards_queue_once() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(24).unwrap();
        lines.inject_pulse(24, 1500);
        lines.fail_next_drain(24);

        let mut edges = Vec::new();
        assert!(source.read_edges(&mut edges).is_err());
        assert!(edges.is_empty());

        lines.inject_pulse(24, 1500);
        source.read_edges(&mut edges).unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn broken_readiness_is_reported() {
        let lines = SimulatedLines::new();
        let source = lines.subscribe_edges(25).unwrap();
        lines.break_readiness();
        assert!(lines
            .wait_ready(&[&source], Duration::from_millis(10))
            .is_err());
        lines.repair_readiness();
        assert!(lines
            .wait_ready(&[&source], Duration::from_millis(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sweep_turns_around_at_limits() {
        let settings = SweepSettings {
            min_us: 1000,
            max_us: 1020,
            step_us: 10,
            frame: RC_FRAME,
        };
        assert_eq!(settings.next_width(1000, true), (1010, true));
        assert_eq!(settings.next_width(1010, true), (1020, false));
        assert_eq!(settings.next_width(1020, false), (1010, false));
        assert_eq!(settings.next_width(1010, false), (1000, true));
    }

    #[test]
    fn sweep_generator_feeds_subscriber() {
        let lines = SimulatedLines::new();
        let _source = lines.subscribe_edges(26).unwrap();
        let sweep = lines.spawn_sweep(
            26,
            SweepSettings {
                frame: Duration::from_millis(2),
                ..SweepSettings::default()
            },
        );
        assert!(sweep.is_running());
        thread::sleep(Duration::from_millis(50));
        drop(sweep);
        assert!(lines.pending_edges(26) >= 2);
    }
}
