use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::capture::capture_worker::{spawn_capture_worker, WorkerControl};
use crate::capture::monitor::{Monitor, MonitorShared, MonitorState, PulseObserver};
use crate::error::{HelifxError, Result};
use crate::gpio::{validate_line, LineBackend};

/// Tunables for the capture subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Upper bound on simultaneously started monitors
    pub max_monitors: usize,
    /// Samples kept per monitor for averaging
    pub sample_capacity: usize,
    /// Initial averaging window of new monitors
    pub average_window: Duration,
    /// Longest single readiness wait of the worker
    pub wait_timeout: Duration,
    /// Worker sleep while the active set is empty
    pub idle_sleep: Duration,
    /// Period of the worker's throughput log line
    pub stats_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_monitors: 8,
            sample_capacity: 128,
            average_window: Duration::from_millis(200),
            wait_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(100),
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_monitors == 0 {
            return Err(HelifxError::InvalidArgument(
                "max_monitors must be at least 1".to_string(),
            ));
        }
        if self.sample_capacity == 0 {
            return Err(HelifxError::InvalidArgument(
                "sample_capacity must be at least 1".to_string(),
            ));
        }
        if self.wait_timeout.is_zero() || self.idle_sleep.is_zero() {
            return Err(HelifxError::InvalidArgument(
                "wait_timeout and idle_sleep must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct ActiveSet<S> {
    slots: Vec<Option<Arc<MonitorShared<S>>>>,
    worker: Option<WorkerControl>,
    // bumped on every start and stop
    generation: u64,
    // generation of the snapshot the worker is iterating, if any
    held_generation: Option<u64>,
}

impl<S> ActiveSet<S> {
    fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn held_before(&self, generation: u64) -> bool {
        self.held_generation.is_some_and(|held| held < generation)
    }
}

pub(crate) struct RegistryShared<B: LineBackend> {
    pub(crate) backend: B,
    pub(crate) settings: CaptureSettings,
    active: Mutex<ActiveSet<B::Source>>,
    cycle_done: Condvar,
    closed: AtomicBool,
    workers_spawned: AtomicU64,
}

impl<B: LineBackend> RegistryShared<B> {
    pub(crate) fn activate(self: &Arc<Self>, monitor: &Arc<MonitorShared<B::Source>>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HelifxError::NotReady(
                "capture registry has been shut down".to_string(),
            ));
        }

        if !monitor.active.load(Ordering::Acquire) {
            monitor.discard_pending();
        }

        let mut set = self.active.lock();
        if monitor.active.load(Ordering::Acquire) {
            debug!("PWM monitor for {} already running", monitor.display_name());
            return Ok(());
        }

        let Some(slot) = set.slots.iter().position(Option::is_none) else {
            error!(
                "Cannot start PWM monitor for {}: all {} slots in use",
                monitor.display_name(),
                self.settings.max_monitors
            );
            return Err(HelifxError::ResourceExhausted(format!(
                "maximum number of active PWM monitors ({}) reached",
                self.settings.max_monitors
            )));
        };

        // a worker that gave up after a readiness failure is replaced
        if set.worker.as_ref().is_some_and(WorkerControl::has_exited) {
            if let Some(dead) = set.worker.take() {
                dead.shutdown();
            }
            for other in set.slots.iter().flatten() {
                other.orphaned.store(false, Ordering::Release);
            }
            info!("Replacing exited PWM capture worker");
        }

        set.slots[slot] = Some(Arc::clone(monitor));
        set.generation += 1;
        monitor.orphaned.store(false, Ordering::Release);
        monitor.active.store(true, Ordering::Release);

        if set.worker.is_none() {
            let generation = self.workers_spawned.fetch_add(1, Ordering::AcqRel) + 1;
            match spawn_capture_worker(Arc::clone(self), generation) {
                Ok(worker) => set.worker = Some(worker),
                Err(e) => {
                    self.workers_spawned.fetch_sub(1, Ordering::AcqRel);
                    set.slots[slot] = None;
                    monitor.active.store(false, Ordering::Release);
                    error!("Failed to spawn PWM capture worker: {}", e);
                    return Err(HelifxError::ResourceExhausted(format!(
                        "failed to spawn PWM capture worker: {e}"
                    )));
                }
            }
        }

        let count = set.count();
        drop(set);
        info!(
            "PWM monitor started for {} ({} active)",
            monitor.display_name(),
            count
        );
        Ok(())
    }

    /// Removes `monitor` from the active set
    ///
    /// Returns once the worker no longer holds a snapshot containing it, so no
    /// edge of the monitor is processed afterwards and dropping it releases the
    /// line. The last stop also joins the worker.
    pub(crate) fn deactivate(&self, monitor: &Arc<MonitorShared<B::Source>>) {
        let (worker, count) = {
            let mut set = self.active.lock();
            if !monitor.active.swap(false, Ordering::AcqRel) {
                return;
            }
            if let Some(slot) = set
                .slots
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|m| Arc::ptr_eq(m, monitor)))
            {
                *slot = None;
            }
            monitor.orphaned.store(false, Ordering::Release);
            set.generation += 1;
            let generation = set.generation;

            let count = set.count();
            let worker = if count == 0 { set.worker.take() } else { None };
            if let Some(worker) = &worker {
                worker.signal_stop();
            }

            let on_worker = set
                .worker
                .as_ref()
                .or(worker.as_ref())
                .is_some_and(WorkerControl::is_current_thread);
            if !on_worker {
                self.wait_for_release(&mut set, generation);
            }
            (worker, count)
        };

        if let Some(worker) = worker {
            worker.shutdown();
            debug!("PWM capture worker joined, no active monitors left");
        }
        info!(
            "PWM monitor stopped for {} ({} active)",
            monitor.display_name(),
            count
        );
    }

    fn wait_for_release(&self, set: &mut MutexGuard<'_, ActiveSet<B::Source>>, generation: u64) {
        if !set.held_before(generation) {
            return;
        }
        self.backend.wake();
        while set.held_before(generation) {
            self.cycle_done.wait(set);
        }
    }

    /// Snapshot for one worker cycle, `None` once the worker is told to stop
    pub(crate) fn snapshot_active(&self, stop: &AtomicBool) -> Option<Vec<Arc<MonitorShared<B::Source>>>> {
        let mut set = self.active.lock();
        if stop.load(Ordering::Acquire) {
            return None;
        }
        let active: Vec<_> = set.slots.iter().flatten().cloned().collect();
        set.held_generation = (!active.is_empty()).then_some(set.generation);
        Some(active)
    }

    /// Called by the worker after dropping its snapshot
    pub(crate) fn finish_cycle(&self) {
        self.active.lock().held_generation = None;
        self.cycle_done.notify_all();
    }

    /// Final bookkeeping of an ending worker thread
    ///
    /// A worker that failed orphans every active monitor until the next start
    /// replaces it.
    pub(crate) fn retire_worker(&self, exited: &AtomicBool, failed: bool) {
        let mut set = self.active.lock();
        set.held_generation = None;
        if failed {
            for monitor in set.slots.iter().flatten() {
                monitor.orphaned.store(true, Ordering::Release);
                warn!(
                    "PWM monitor for {} orphaned by capture worker exit",
                    monitor.display_name()
                );
            }
        }
        exited.store(true, Ordering::Release);
        drop(set);
        self.cycle_done.notify_all();
    }
}

/// Owner of the bounded active-monitor set and the shared capture worker
///
/// One worker thread serves every started monitor. It is spawned when the
/// first monitor starts and joined when the last one stops, so a registry with
/// no running monitors has no thread at all. Cloning shares the same set.
pub struct CaptureRegistry<B: LineBackend> {
    shared: Arc<RegistryShared<B>>,
}

impl<B: LineBackend> Clone for CaptureRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: LineBackend> fmt::Debug for CaptureRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRegistry")
            .field("settings", &self.shared.settings)
            .field("active", &self.active_count())
            .field("worker_running", &self.worker_running())
            .finish()
    }
}

impl<B: LineBackend> CaptureRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self::build(backend, CaptureSettings::default())
    }

    pub fn with_settings(backend: B, settings: CaptureSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::build(backend, settings))
    }

    fn build(backend: B, settings: CaptureSettings) -> Self {
        info!(
            "Capture registry ready (max {} monitors, {} samples each)",
            settings.max_monitors, settings.sample_capacity
        );
        let slots = (0..settings.max_monitors).map(|_| None).collect();
        Self {
            shared: Arc::new(RegistryShared {
                backend,
                settings,
                active: Mutex::new(ActiveSet {
                    slots,
                    worker: None,
                    generation: 0,
                    held_generation: None,
                }),
                cycle_done: Condvar::new(),
                closed: AtomicBool::new(false),
                workers_spawned: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.shared.settings
    }

    /// Subscribes to both edges of `line_id` and returns a stopped monitor
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for lines above 27 or owned by the audio HAT,
    /// `HardwareUnavailable` when the backend refuses the subscription.
    pub fn create_monitor(&self, line_id: u8, label: Option<&str>) -> Result<Monitor<B>> {
        self.create(line_id, label, None)
    }

    /// Like [`CaptureRegistry::create_monitor`], with a callback for every accepted pulse
    pub fn create_monitor_with_observer(
        &self,
        line_id: u8,
        label: Option<&str>,
        observer: Arc<dyn PulseObserver>,
    ) -> Result<Monitor<B>> {
        self.create(line_id, label, Some(observer))
    }

    fn create(
        &self,
        line_id: u8,
        label: Option<&str>,
        observer: Option<Arc<dyn PulseObserver>>,
    ) -> Result<Monitor<B>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(HelifxError::NotReady(
                "capture registry has been shut down".to_string(),
            ));
        }
        validate_line(line_id)?;

        let source = self.shared.backend.subscribe_edges(line_id).map_err(|e| {
            error!("Failed to subscribe to edges on line {}: {}", line_id, e);
            HelifxError::from(e)
        })?;

        let settings = &self.shared.settings;
        let shared = Arc::new(MonitorShared::new(
            line_id,
            label.map(str::to_string),
            source,
            MonitorState::new(settings.sample_capacity, settings.average_window),
            observer,
        ));
        info!("PWM monitor created for {}", shared.display_name());

        Ok(Monitor::new(shared, Arc::clone(&self.shared)))
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().count()
    }

    pub fn worker_running(&self) -> bool {
        self.shared
            .active
            .lock()
            .worker
            .as_ref()
            .is_some_and(|w| !w.has_exited())
    }

    /// Total capture worker threads spawned over the registry's lifetime
    pub fn workers_spawned(&self) -> u64 {
        self.shared.workers_spawned.load(Ordering::Acquire)
    }

    /// Stops every monitor, joins the worker and refuses further creation
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let worker = {
            let mut set = self.shared.active.lock();
            for slot in set.slots.iter_mut() {
                if let Some(monitor) = slot.take() {
                    monitor.active.store(false, Ordering::Release);
                }
            }
            set.generation += 1;
            let worker = set.worker.take();
            if let Some(worker) = &worker {
                worker.signal_stop();
            }
            worker
        };
        self.shared.backend.wake();
        if let Some(worker) = worker {
            worker.shutdown();
        }
        info!("Capture registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimulatedLines;

    #[test]
    fn default_settings_match_rc_receiver_needs() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.max_monitors, 8);
        assert_eq!(settings.sample_capacity, 128);
        assert_eq!(settings.average_window, Duration::from_millis(200));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_capacity_settings_are_rejected() {
        let settings = CaptureSettings {
            max_monitors: 0,
            ..CaptureSettings::default()
        };
        assert!(matches!(
            CaptureRegistry::with_settings(SimulatedLines::new(), settings),
            Err(HelifxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn created_monitor_is_stopped_and_subscribed() {
        let lines = SimulatedLines::new();
        let registry = CaptureRegistry::new(lines.clone());
        let monitor = registry.create_monitor(17, Some("turret")).unwrap();

        assert!(!monitor.is_running());
        assert_eq!(monitor.label(), Some("turret"));
        assert!(lines.is_subscribed(17));
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.worker_running());
    }

    #[test]
    fn start_and_stop_manage_worker() {
        let registry = CaptureRegistry::new(SimulatedLines::new());
        let monitor = registry.create_monitor(17, None).unwrap();

        monitor.start().unwrap();
        monitor.start().unwrap();
        assert_eq!(registry.active_count(), 1);
        assert!(registry.worker_running());
        assert_eq!(registry.workers_spawned(), 1);

        monitor.stop();
        monitor.stop();
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.worker_running());
    }

    #[test]
    fn stop_flag_ends_snapshots() {
        let registry = CaptureRegistry::new(SimulatedLines::new());
        let monitor = registry.create_monitor(17, None).unwrap();
        monitor.start().unwrap();

        let stop = AtomicBool::new(false);
        let active = registry.shared.snapshot_active(&stop).unwrap();
        assert_eq!(active.len(), 1);
        assert!(registry.shared.active.lock().held_generation.is_some());
        drop(active);
        registry.shared.finish_cycle();
        assert_eq!(registry.shared.active.lock().held_generation, None);

        stop.store(true, Ordering::Release);
        assert!(registry.shared.snapshot_active(&stop).is_none());
    }

    #[test]
    fn full_stop_retires_worker_before_next_spawn() {
        let registry = CaptureRegistry::new(SimulatedLines::new());
        let a = registry.create_monitor(17, None).unwrap();
        let b = registry.create_monitor(22, None).unwrap();
        for round in 1..=10u64 {
            a.start().unwrap();
            a.stop();
            {
                let set = registry.shared.active.lock();
                assert!(set.worker.is_none());
                assert_eq!(set.held_generation, None);
            }
            b.start().unwrap();
            b.stop();
            assert_eq!(registry.workers_spawned(), round * 2);
        }
        assert!(!registry.worker_running());
    }

    #[test]
    fn shutdown_refuses_new_monitors() {
        let registry = CaptureRegistry::new(SimulatedLines::new());
        let monitor = registry.create_monitor(17, None).unwrap();
        monitor.start().unwrap();

        registry.shutdown();
        assert!(!monitor.is_running());
        assert!(!registry.worker_running());
        assert!(matches!(monitor.start(), Err(HelifxError::NotReady(_))));
        assert!(matches!(
            registry.create_monitor(22, None),
            Err(HelifxError::NotReady(_))
        ));
    }
}
