// Binary includes library modules - some public API items are only for library consumers
#![allow(unused)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod arm;
mod can;
mod config;
mod duration;
mod health;
mod idle;
mod protocol;
mod registry;
mod server;
mod sink;

use arm::ArmTelemetryProcessor;
use can::CanMetricsProcessor;
use config::Settings;
use idle::IdleTracker;
use server::{MessageHandler, TelemetryServer};
use sink::{JsonlSink, SinkHandle};

#[derive(Parser, Debug)]
#[command(name = "armwatch")]
#[command(about = "Telemetry ingestion and health monitoring for a robot arm rig")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CAN metrics server listen address as host:port
    #[arg(long, conflicts_with_all = ["can_host", "can_port"])]
    can: Option<String>,

    /// Arm telemetry server listen address as host:port
    #[arg(long, conflicts_with_all = ["arm_host", "arm_port"])]
    arm: Option<String>,

    /// Host for the CAN metrics server
    #[arg(long)]
    can_host: Option<String>,

    /// Port for the CAN metrics server
    #[arg(long)]
    can_port: Option<u16>,

    /// Host for the arm telemetry server
    #[arg(long)]
    arm_host: Option<String>,

    /// Port for the arm telemetry server
    #[arg(long)]
    arm_port: Option<u16>,

    /// Arm idle timeout (e.g., "1s", "500ms"); omit to disable idle detection
    #[arg(long)]
    idle_timeout: Option<String>,

    /// Keep forwarding camera frames while the arm is idle
    #[arg(long)]
    no_drop_camera_when_idle: bool,

    /// Write sink records to a JSONL file instead of stdout
    #[arg(short, long)]
    sink: Option<PathBuf>,
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {addr:?}"))?;
    let port = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port in {addr:?}"))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(ref addr) = args.can {
        (settings.can.host, settings.can.port) = split_addr(addr)?;
    }
    if let Some(ref addr) = args.arm {
        (settings.arm.host, settings.arm.port) = split_addr(addr)?;
    }
    if let Some(host) = args.can_host {
        settings.can.host = host;
    }
    if let Some(port) = args.can_port {
        settings.can.port = port;
    }
    if let Some(host) = args.arm_host {
        settings.arm.host = host;
    }
    if let Some(port) = args.arm_port {
        settings.arm.port = port;
    }
    if let Some(ref value) = args.idle_timeout {
        let timeout = duration::parse_duration(value)
            .map_err(|e| anyhow::anyhow!("invalid --idle-timeout value {value:?}: {e}"))?;
        settings.arm.idle_timeout_s = Some(timeout.as_secs_f64());
    }
    if args.no_drop_camera_when_idle {
        settings.arm.drop_camera_when_idle = false;
    }

    match settings.arm.idle_timeout() {
        Some(timeout) => info!("arm idle timeout: {}", duration::format_duration(timeout)),
        None => info!("arm idle detection disabled"),
    }

    let sink = match args.sink {
        Some(ref path) => SinkHandle::new(Arc::new(JsonlSink::file(path)?)),
        None => SinkHandle::new(Arc::new(JsonlSink::stdout())),
    };

    let can_handler: Arc<Mutex<dyn MessageHandler>> =
        Arc::new(Mutex::new(CanMetricsProcessor::new(sink.clone())));
    let idle = IdleTracker::new(settings.arm.idle_timeout(), settings.arm.drop_camera_when_idle);
    let arm_handler: Arc<Mutex<dyn MessageHandler>> =
        Arc::new(Mutex::new(ArmTelemetryProcessor::new(sink.clone(), idle)));

    let can_server = TelemetryServer::bind("can", &settings.can.addr(), can_handler).await?;
    let arm_server = TelemetryServer::bind("arm", &settings.arm.addr(), arm_handler).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    can_server.stop().await;
    arm_server.stop().await;
    Ok(())
}
