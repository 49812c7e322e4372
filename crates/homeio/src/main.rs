use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use homeio::Config;
use homeio::DeviceQuery;
use homeio::Engine;
use homeio::EngineConfig;
use homeio::PollReport;
use homeio::StateChangeRequest;
use homeio::config::LoggingConfig;
use homeio::engine::Command;
use homeio::engine::CommandStatus;
use homeio::engine::EntryId;
use homeio::engine::RoomId;
use homeio::engine::VendorOutcome;
use homeio::engine::build_adapters;
use homeio::format_diagnostics;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "homeio", about = "Device state reconciliation for home lighting")]
struct Args {
    /// Configuration file; repeat to merge several
    #[arg(short, long = "config", default_value = "homeio.toml")]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Poll every vendor on the configured interval until interrupted
    Run {
        /// Make every Nth cycle a full one; the rest are quick
        #[arg(long, default_value_t = 1)]
        full_every: u32,
    },
    /// Run a single poll cycle and print its report
    Poll {
        /// Skip adapters that only take part in full cycles
        #[arg(long)]
        quick: bool,
    },
    /// Print the caller-facing device view
    Devices {
        #[arg(long, conflicts_with_all = ["room", "exclude_room"])]
        device: Option<String>,
        #[arg(long, conflicts_with = "exclude_room")]
        room: Option<i64>,
        #[arg(long)]
        exclude_room: Option<i64>,
    },
    /// Record a preference and queue a command if the device has drifted
    Set {
        device: String,
        command: String,
        /// JSON value, or a bare word such as `on`
        value: String,
    },
    /// Queue a command unconditionally, even while another is in flight
    Send {
        device: String,
        command: String,
        value: String,
    },
    /// List a device's outstanding commands
    Queue { device: String },
    /// Move a queued command to a new status
    Complete { entry: i64, status: CommandStatus },
}

fn init_logging(cfg: &LoggingConfig) {
    let targets = cfg.overrides.iter().fold(
        Targets::new().with_default(LevelFilter::from(cfg.level)),
        |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(targets)
        .init();
}

/// Accept JSON where possible so `50` is a number and `"on"` or `on` a string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn log_report(report: &PollReport) {
    for vendor in &report.vendors {
        match &vendor.outcome {
            VendorOutcome::Completed(stats) => info!(
                vendor = %vendor.vendor,
                duration_ms = vendor.duration_ms,
                "Polled {} devices ({} new, {} failed, {} commands queued)",
                stats.seen,
                stats.inserted,
                stats.failed,
                stats.enqueued
            ),
            VendorOutcome::Skipped { reason } => info!(vendor = %vendor.vendor, "Skipped: {}", reason),
            VendorOutcome::Failed { error } => warn!(vendor = %vendor.vendor, "Poll failed: {}", error),
        }
    }
}

async fn run(engine: Arc<Engine>, interval: Duration, full_every: u32) -> Result<()> {
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    info!("Polling every {}s; press Ctrl+C to exit", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let full_every = full_every.max(1);
    let mut cycle: u32 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let quick = cycle % full_every != 0;
        cycle = cycle.wrapping_add(1);

        let report = engine.poll_cycle(quick, &token).await;
        log_report(&report);
        if report.cancelled {
            break;
        }
    }

    info!("homeio shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, diagnostics) = Config::from_files(&args.config).context("Failed to load configuration")?;
    if !diagnostics.is_empty() {
        eprintln!("{}", format_diagnostics(&diagnostics));
    }
    init_logging(&config.logging);
    info!("Loaded config from: {:?}", args.config);

    let store = homeio::store::open(&config.store).context("Failed to open store")?;
    let adapters = build_adapters(&config);
    if adapters.is_empty() {
        warn!("No vendor integrations configured");
    }
    let engine = Arc::new(Engine::new(store, adapters, EngineConfig::from(&config.poll)));

    match args.command {
        Cmd::Run { full_every } => {
            run(engine, Duration::from_secs(config.poll.interval_secs), full_every).await
        }
        Cmd::Poll { quick } => {
            let report = engine.poll_cycle(quick, &CancellationToken::new()).await;
            log_report(&report);
            print_json(&report)
        }
        Cmd::Devices {
            device,
            room,
            exclude_room,
        } => {
            let query = DeviceQuery {
                device,
                room: room.map(RoomId),
                exclude_room: exclude_room.map(RoomId),
            };
            print_json(&engine.devices(&query)?)
        }
        Cmd::Set {
            device,
            command,
            value,
        } => {
            let outcome = engine
                .set_state(&StateChangeRequest {
                    device,
                    command,
                    value: parse_value(&value),
                })
                .await?;
            print_json(&serde_json::json!({
                "device": outcome.device,
                "queued": outcome.queued,
                "suppressed": outcome.suppressed,
            }))
        }
        Cmd::Send {
            device,
            command,
            value,
        } => {
            let command = Command::parse(&command, &parse_value(&value))?;
            print_json(&engine.send_command(&device, command)?)
        }
        Cmd::Queue { device } => print_json(&engine.pending_commands(&device)?),
        Cmd::Complete { entry, status } => print_json(&engine.transition(EntryId(entry), status)?),
    }
}
