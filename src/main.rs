//! Frame relay CLI application

use anyhow::{Context, Result};
use clap::Parser;
use frame_relay::capture::{CaptureError, VideoSource};
use frame_relay::config::{Config, ConfigError};
use frame_relay::transmit::{Connect, SendError, Transmitter, UdpConnector};
use frame_relay::{open_source, CaptureLoop, LoopConfig, LoopError, RelayStats};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// How long a Ctrl+C waits for the loop to drain before exiting anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_DEVICE: u8 = 3;
const EXIT_SOCKET: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "frame-relay")]
#[command(about = "Captures video frames into a double buffer and forwards each one over UDP")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video device: "generator" or a V4L2 path such as /dev/video0
    #[arg(long)]
    device: Option<String>,

    /// Destination IPv4 address
    #[arg(long)]
    dest_host: Option<String>,

    /// Destination UDP port
    #[arg(long)]
    dest_port: Option<u16>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match block_on_detached(run(cli)).and_then(|result| result) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Frame relay failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Drives `future` on a fresh runtime. Blocking tasks still running once it
/// completes are abandoned rather than awaited.
fn block_on_detached<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(device) = cli.device {
        config.source.device = device;
    }
    if let Some(host) = cli.dest_host {
        config.network.dest_host = host;
    }
    if let Some(port) = cli.dest_port {
        config.network.dest_port = port;
    }
    config.validate()?;

    if let Some(path) = &cli.write_config {
        config.save(path)?;
        info!(path = %path.display(), "Configuration written");
        return Ok(());
    }

    let dest = config.network.destination()?;

    info!(
        device = %config.source.device,
        format = %config.source.requested_format(),
        dest = %dest,
        policy = ?config.network.on_send_failure,
        "Configuration loaded"
    );

    let source = open_source(&config.source)
        .with_context(|| format!("opening video device {}", config.source.device))?;

    let connector = UdpConnector::new(config.network.local_port, config.network.nonblocking);
    let transmitter = Transmitter::connect(connector, dest, config.network.transmitter_options())?;

    let capture_loop = CaptureLoop::new(
        source,
        transmitter,
        LoopConfig {
            requested_format: config.source.requested_format(),
            dequeue_timeout: config.source.dequeue_timeout(),
            memory_limit: config.pool.memory_limit_bytes,
        },
    );

    supervise(
        capture_loop,
        config.stats_interval_seconds,
        SHUTDOWN_GRACE,
        tokio::signal::ctrl_c(),
    )
    .await
}

/// Runs the capture loop on a blocking thread until it ends or `stop` fires.
///
/// After `stop`, the loop gets `grace` to drain. A loop still blocked in the
/// device after that is left behind.
async fn supervise<V, C, S>(
    mut capture_loop: CaptureLoop<V, C>,
    stats_interval_seconds: u64,
    grace: Duration,
    stop: S,
) -> Result<()>
where
    V: VideoSource,
    C: Connect,
    CaptureLoop<V, C>: Send + 'static,
    S: Future<Output = io::Result<()>>,
{
    let shutdown = capture_loop.shutdown_handle();
    let stats = capture_loop.stats_handle();

    let mut task = tokio::task::spawn_blocking(move || capture_loop.run());

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval_seconds.max(1)));
    ticker.tick().await;
    let mut last = (Instant::now(), RelayStats::default());

    tokio::pin!(stop);
    info!("Streaming started, press Ctrl+C to stop");

    loop {
        tokio::select! {
            joined = &mut task => {
                joined.context("capture loop panicked")??;
                log_stats(&stats.snapshot(), None);
                return Ok(());
            }
            _ = ticker.tick(), if stats_interval_seconds > 0 => {
                let current = stats.snapshot();
                log_stats(&current, Some((&last.1, last.0.elapsed().as_secs_f64())));
                last = (Instant::now(), current);
            }
            signal = &mut stop => {
                signal?;
                info!("Shutting down");
                shutdown.shutdown();

                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => joined.context("capture loop panicked")??,
                    Err(_) => warn!(
                        grace_ms = %grace.as_millis(),
                        "Capture loop still blocked in the device, exiting anyway"
                    ),
                }
                log_stats(&stats.snapshot(), None);
                return Ok(());
            }
        }
    }
}

fn log_stats(current: &RelayStats, previous: Option<(&RelayStats, f64)>) {
    let (fps, kbps) = previous
        .map(|(prev, secs)| {
            (
                current.calculate_fps(prev, secs),
                current.calculate_bitrate_kbps(prev, secs),
            )
        })
        .unwrap_or_default();

    info!(
        captured = %current.frames_captured,
        sent = %current.frames_sent,
        dropped = %current.frames_dropped,
        send_errors = %current.send_errors,
        retries = %current.transient_retries,
        restarts = %current.stream_restarts,
        fps = %format!("{:.1}", fps),
        kbps = %format!("{:.0}", kbps),
        "Stats"
    );
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<LoopError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if err.downcast_ref::<CaptureError>().is_some() {
        return EXIT_DEVICE;
    }
    if err.downcast_ref::<SendError>().is_some() {
        return EXIT_SOCKET;
    }
    EXIT_FAILURE
}
