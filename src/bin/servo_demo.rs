use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use helifx::logging;
use helifx::servo::{MotionConfig, PulseRange, Servo};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Servo bench sequence: center, max, min, center, then instant mode and reset
#[derive(Parser, Debug)]
#[command(name = "servo_demo", version)]
struct Cli {
    /// Input minimum in microseconds
    #[arg(long, default_value_t = 1000)]
    input_min: i32,

    /// Input maximum in microseconds
    #[arg(long, default_value_t = 2000)]
    input_max: i32,

    /// Output minimum in microseconds
    #[arg(long, default_value_t = 800)]
    output_min: i32,

    /// Output maximum in microseconds
    #[arg(long, default_value_t = 2200)]
    output_max: i32,

    /// Maximum speed in µs/s, 0 for unlimited
    #[arg(long, default_value_t = 500.0)]
    max_speed: f64,

    /// Maximum acceleration in µs/s², 0 for unlimited
    #[arg(long, default_value_t = 2000.0)]
    max_accel: f64,

    /// Update rate in Hz
    #[arg(long, default_value_t = 50)]
    update_rate: u32,

    /// Give up on a move after this many seconds
    #[arg(long, default_value_t = 30)]
    settle_timeout_secs: u64,
}

impl Cli {
    fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            max_speed_us_per_sec: self.max_speed,
            max_accel_us_per_sec2: self.max_accel,
            update_rate_hz: self.update_rate,
            input_range: PulseRange::new(self.input_min, self.input_max),
            output_range: PulseRange::new(self.output_min, self.output_max),
        }
    }
}

const SEQUENCE: [(&str, i32); 4] = [
    ("center", 1500),
    ("maximum", 2000),
    ("minimum", 1000),
    ("center", 1500),
];
const SETTLED_READINGS: u32 = 5;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    logging::setup()?;
    let cli = Cli::parse();
    let mut config = cli.motion_config();

    let servo =
        Servo::create_named("demo", config).map_err(|e| eyre!("Failed to create servo: {}", e))?;
    info!(
        "Servo demo: input {}-{} µs, output {}-{} µs, speed {} µs/s, accel {} µs/s², {} Hz",
        config.input_range.min_us,
        config.input_range.max_us,
        config.output_range.min_us,
        config.output_range.max_us,
        config.max_speed_us_per_sec,
        config.max_accel_us_per_sec2,
        config.update_rate_hz
    );

    let settle_timeout = Duration::from_secs(cli.settle_timeout_secs);
    for (name, input_us) in SEQUENCE {
        info!("Moving to {} ({} µs input)", name, input_us);
        servo.set_input(input_us);
        if wait_until_settled(&servo, settle_timeout) {
            info!("Position reached: {} µs", servo.output_us());
        } else {
            warn!(
                "Servo did not settle within {:?}, output {} µs target {} µs",
                settle_timeout,
                servo.output_us(),
                servo.target_us()
            );
        }
        thread::sleep(Duration::from_secs(1));
    }

    info!("Instant position change (no limits)");
    config.max_speed_us_per_sec = 0.0;
    config.max_accel_us_per_sec2 = 0.0;
    servo.set_config(config)?;
    servo.set_input(2000);
    thread::sleep(PROGRESS_INTERVAL);
    info!("Input 2000 µs -> output {} µs", servo.output_us());

    servo.reset(1500);
    info!("Reset to {} µs", servo.output_us());

    info!("Demo finished after {} servo ticks", servo.ticks());
    servo.destroy();
    Ok(())
}

/// Polls until the output matches the target for several consecutive readings
fn wait_until_settled(servo: &Servo, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut settled = 0;
    while settled < SETTLED_READINGS {
        if Instant::now() >= deadline {
            return false;
        }
        let snapshot = servo.snapshot();
        let (output, target) = (servo.output_us(), servo.target_us());
        info!(
            "  output {:>4} µs  target {:>4} µs  velocity {:>6.0} µs/s  error {:>4} µs",
            output,
            target,
            snapshot.velocity_us_per_sec,
            target - output
        );
        if output == target {
            settled += 1;
        } else {
            settled = 0;
        }
        thread::sleep(PROGRESS_INTERVAL);
    }
    true
}
