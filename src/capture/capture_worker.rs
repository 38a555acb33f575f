use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

use crate::capture::monitor::MonitorShared;
use crate::capture::registry::RegistryShared;
use crate::gpio::{EdgeEvent, EdgeSource, HardwareError, LineBackend};

/// Handle to the running capture worker
pub(crate) struct WorkerControl {
    stop: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

impl WorkerControl {
    /// True once the worker loop has ended and released the active set
    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Raised under the active-set lock, so the worker takes no further snapshot
    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Signals the worker and joins it
    ///
    /// Called from the worker itself (an observer stopping the last monitor),
    /// the thread is left to exit on its own.
    pub(crate) fn shutdown(self) {
        self.signal_stop();
        if self.is_current_thread() {
            warn!("Capture worker asked to join itself; leaving it detached");
            return;
        }
        if self.handle.join().is_err() {
            error!("Capture worker panicked");
        }
    }
}

/// Retires the worker in the registry when its thread ends, panics included
struct WorkerExit<'a, B: LineBackend> {
    registry: &'a RegistryShared<B>,
    exited: &'a AtomicBool,
    failed: bool,
}

impl<B: LineBackend> Drop for WorkerExit<'_, B> {
    fn drop(&mut self) {
        self.registry.retire_worker(self.exited, self.failed);
    }
}

pub(crate) fn spawn_capture_worker<B: LineBackend>(
    registry: Arc<RegistryShared<B>>,
    generation: u64,
) -> io::Result<WorkerControl> {
    let stop = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));

    let handle = {
        let stop = Arc::clone(&stop);
        let exited = Arc::clone(&exited);
        thread::Builder::new()
            .name(format!("pwm-capture-{generation}"))
            .spawn(move || {
                let mut exit = WorkerExit {
                    registry: &registry,
                    exited: &exited,
                    failed: true,
                };
                exit.failed = run_capture_loop(&registry, &stop) == LoopEnd::Failed;
            })?
    };

    Ok(WorkerControl {
        stop,
        exited,
        thread_id: handle.thread().id(),
        handle,
    })
}

struct CaptureStats {
    edges: u64,
    readings: u64,
    drain_failures: u64,
    last_log: DateTime<Local>,
    interval: chrono::Duration,
}

impl CaptureStats {
    fn new(interval: Duration) -> Self {
        Self {
            edges: 0,
            readings: 0,
            drain_failures: 0,
            last_log: Local::now(),
            interval: chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    fn maybe_log(&mut self, active: usize) {
        let now = Local::now();
        if now - self.last_log > self.interval {
            info!(
                "PWM capture stats: {} edges, {} readings, {} drain failures across {} monitors in last {} seconds",
                self.edges,
                self.readings,
                self.drain_failures,
                active,
                self.interval.num_seconds()
            );
            self.edges = 0;
            self.readings = 0;
            self.drain_failures = 0;
            self.last_log = now;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Stopped,
    Failed,
}

enum Cycle {
    Idle,
    Done,
    Failed,
}

fn run_capture_loop<B: LineBackend>(registry: &RegistryShared<B>, stop: &AtomicBool) -> LoopEnd {
    let settings = &registry.settings;
    info!("PWM capture worker started");

    let mut edges: Vec<EdgeEvent> = Vec::with_capacity(64);
    let mut stats = CaptureStats::new(settings.stats_interval);

    let end = loop {
        let Some(active) = registry.snapshot_active(stop) else {
            break LoopEnd::Stopped;
        };
        let cycle = run_cycle(registry, &active, &mut edges, &mut stats);
        // stop() waits for the snapshot to be gone before it returns
        drop(active);
        registry.finish_cycle();

        match cycle {
            Cycle::Idle => thread::sleep(settings.idle_sleep),
            Cycle::Done => {}
            Cycle::Failed => break LoopEnd::Failed,
        }
    };

    info!("PWM capture worker stopped");
    end
}

fn run_cycle<B: LineBackend>(
    registry: &RegistryShared<B>,
    active: &[Arc<MonitorShared<B::Source>>],
    edges: &mut Vec<EdgeEvent>,
    stats: &mut CaptureStats,
) -> Cycle {
    if active.is_empty() {
        return Cycle::Idle;
    }

    let sources: Vec<&B::Source> = active.iter().map(|monitor| &monitor.source).collect();
    let ready = match registry
        .backend
        .wait_ready(&sources, registry.settings.wait_timeout)
    {
        Ok(ready) => ready,
        Err(HardwareError::Interrupted) => return Cycle::Done,
        Err(e) => {
            error!("Readiness wait failed, PWM capture worker exiting: {}", e);
            return Cycle::Failed;
        }
    };

    for index in ready {
        let Some(monitor) = active.get(index) else {
            continue;
        };
        if !monitor.active.load(Ordering::Acquire) {
            continue;
        }
        edges.clear();
        if let Err(e) = monitor.source.read_edges(edges) {
            warn!(
                "Failed to drain edges on line {}: {}",
                monitor.source.line_id(),
                e
            );
            stats.drain_failures += 1;
            continue;
        }
        for event in edges.drain(..) {
            if !monitor.active.load(Ordering::Acquire) {
                break;
            }
            stats.edges += 1;
            if monitor.process_edge(event).is_some() {
                stats.readings += 1;
            }
        }
    }

    stats.maybe_log(active.len());
    Cycle::Done
}
