use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::{HelifxError, Result};
use crate::servo::motion::{MotionConfig, MotionSnapshot, MotionState};

/// A motion-filtered servo channel with its own update thread
///
/// Inputs and reads go through a mutex shared with the update thread; every
/// call is safe from any thread. Dropping the servo stops and joins the thread.
pub struct Servo {
    name: String,
    state: Arc<Mutex<MotionState>>,
    ticks: Arc<AtomicU64>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Servo {
    pub fn create(config: MotionConfig) -> Result<Self> {
        Self::create_named("servo", config)
    }

    /// Validates `config` and starts the update thread
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for inverted ranges, a zero update rate or negative
    /// limits; `ResourceExhausted` if the thread cannot be spawned.
    pub fn create_named(name: &str, config: MotionConfig) -> Result<Self> {
        let state = Arc::new(Mutex::new(MotionState::new(config)?));
        let ticks = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let worker = {
            let name = name.to_string();
            let state = Arc::clone(&state);
            let ticks = Arc::clone(&ticks);
            thread::Builder::new()
                .name(format!("servo-{name}"))
                .spawn(move || run_servo_loop(&name, &state, &ticks, &stop_rx))
                .map_err(|e| {
                    error!("Failed to spawn servo thread: {}", e);
                    HelifxError::ResourceExhausted(format!("failed to spawn servo thread: {e}"))
                })?
        };

        info!(
            "Servo [{}] created: {}-{} µs -> {}-{} µs, speed {}, accel {}, {} Hz",
            name,
            config.input_range.min_us,
            config.input_range.max_us,
            config.output_range.min_us,
            config.output_range.max_us,
            config.max_speed_us_per_sec,
            config.max_accel_us_per_sec2,
            config.update_rate_hz
        );

        Ok(Self {
            name: name.to_string(),
            state,
            ticks,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records the latest input pulse width
    pub fn set_input(&self, input_us: i32) {
        self.state.lock().set_input(input_us);
    }

    /// Current output, rounded to whole microseconds
    pub fn output_us(&self) -> i32 {
        round_us(self.state.lock().output_us())
    }

    /// Current target, rounded to whole microseconds
    pub fn target_us(&self) -> i32 {
        round_us(self.state.lock().target_us())
    }

    pub fn velocity(&self) -> f64 {
        self.state.lock().velocity()
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        self.state.lock().snapshot()
    }

    /// Puts the servo at rest at `position_us`
    pub fn reset(&self, position_us: i32) {
        self.state.lock().reset(position_us);
        debug!("Servo [{}] reset to {} µs", self.name, position_us);
    }

    /// Replaces the motion parameters; the update period follows on the next tick
    pub fn set_config(&self, config: MotionConfig) -> Result<()> {
        self.state.lock().set_config(config)?;
        info!(
            "Servo [{}] config updated: speed {}, accel {}, {} Hz",
            self.name, config.max_speed_us_per_sec, config.max_accel_us_per_sec2, config.update_rate_hz
        );
        Ok(())
    }

    pub fn config(&self) -> MotionConfig {
        *self.state.lock().config()
    }

    /// Updates performed since creation
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stops the update thread and waits for it
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // closing the channel wakes the thread out of its wait
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Servo [{}] thread panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servo")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl Drop for Servo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn round_us(value: f64) -> i32 {
    value.round() as i32
}

fn run_servo_loop(
    name: &str,
    state: &Mutex<MotionState>,
    ticks: &AtomicU64,
    stop_rx: &Receiver<()>,
) {
    info!("Servo [{}] update thread started", name);
    let mut next_tick = Instant::now() + state.lock().config().tick_period();

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let (snapshot, period) = {
            let mut state = state.lock();
            let snapshot = state.tick();
            (snapshot, state.config().tick_period())
        };
        ticks.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Servo [{}] tick: target {:.1} output {:.1} velocity {:.1}",
            name,
            snapshot.target_us,
            snapshot.output_us,
            snapshot.velocity_us_per_sec
        );

        // absolute deadlines keep the rate free of drift; resync after a stall
        next_tick += period;
        let now = Instant::now();
        if next_tick < now {
            debug!("Servo [{}] fell behind, resynchronising", name);
            next_tick = now + period;
        }
    }

    info!("Servo [{}] update thread stopped", name);
}
