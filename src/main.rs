use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use helifx::capture::{CaptureRegistry, Monitor};
use helifx::config::RigConfig;
use helifx::gpio::{LineBackend, Pull, RppalLines, SimulatedLines, SweepHandle, SweepSettings};
use helifx::logging;
use helifx::orchestrator::{ChannelLink, StatusReporter};
use helifx::servo::Servo;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// RC effects controller: reads receiver channels and drives servos
#[derive(Parser, Debug)]
#[command(name = "helifx", version)]
struct Cli {
    /// Rig configuration file (default: ~/.helifx/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use simulated GPIO lines fed by pulse sweeps instead of the Pi header
    #[arg(long)]
    simulate: bool,

    /// Status log period in milliseconds, 0 disables it
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup()?;
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(RigConfig::default_path);
    RigConfig::ensure_default_config(&path).await?;
    let rig = RigConfig::load(&path).await?;
    rig.validate()
        .map_err(|e| eyre!("Invalid rig config {}: {}", path.display(), e))?;

    let status_interval = Duration::from_millis(cli.status_interval_ms);

    if cli.simulate {
        info!("Starting with simulated GPIO lines");
        let lines = SimulatedLines::new();
        // sweeps must outlive the run; dropped (and joined) afterwards
        let _sweeps: Vec<SweepHandle> = rig
            .channels
            .iter()
            .map(|channel| lines.spawn_sweep(channel.input_line, SweepSettings::default()))
            .collect();
        run(lines, rig, status_interval).await
    } else {
        let lines = RppalLines::new().map_err(|e| eyre!("Failed to open GPIO: {}", e))?;
        run(lines, rig, status_interval).await
    }
}

async fn run<B: LineBackend>(backend: B, rig: RigConfig, status_interval: Duration) -> Result<()> {
    let registry = CaptureRegistry::with_settings(backend, rig.capture.to_settings())?;
    let token = CancellationToken::new();

    let mut monitors: Vec<Arc<Monitor<B>>> = Vec::new();
    let mut tasks = Vec::new();
    let mut reporter = StatusReporter::new(status_interval);

    for channel in &rig.channels {
        if channel.pull != Pull::Off {
            registry
                .backend()
                .set_pull(channel.input_line, channel.pull)
                .map_err(|e| eyre!("Channel '{}': {}", channel.name, e))?;
        }
        let monitor = Arc::new(
            registry
                .create_monitor(channel.input_line, Some(channel.monitor_label()))
                .map_err(|e| eyre!("Channel '{}': {}", channel.name, e))?,
        );
        monitor.start()?;

        let servo = match channel.servo {
            Some(motion) => {
                let servo = Arc::new(Servo::create_named(&channel.name, motion)?);
                let link = ChannelLink::new(
                    &channel.name,
                    Arc::clone(&monitor),
                    Arc::clone(&servo),
                    channel.input_mode,
                );
                tasks.push(link.spawn(token.clone()));
                Some(servo)
            }
            None => None,
        };

        reporter.add_channel(&channel.name, Arc::clone(&monitor), servo);
        monitors.push(monitor);
    }

    info!(
        "Rig running: {} channels, {} linked to servos",
        monitors.len(),
        tasks.len()
    );
    tasks.push(reporter.spawn(token.clone()));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Shutdown requested");
    token.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    // joining the capture worker blocks for up to one readiness timeout
    tokio::task::spawn_blocking(move || {
        registry.shutdown();
        drop(monitors);
    })
    .await
    .map_err(|e| eyre!("Failed to shut down capture: {}", e))?;

    info!("helifx stopped");
    Ok(())
}
