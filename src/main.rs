//! `daq-controller`: publish one instrument driver over RPC.
//!
//! ```text
//! daq-controller ql355 --device /dev/ttyACM0
//! daq-controller synth --device 10.0.0.12 --port 4300 -v
//! daq-controller scpi --simulation
//! ```
//!
//! Exit status is 0 after a clean shutdown, 2 if the instrument could not be reached
//! at startup and 1 for any other failure.

use anyhow::Context;
use clap::Parser;
use daq_controller::config::{ControllerConfig, Overrides};
use daq_controller::{ControllerError, ControllerHost, DriverKind, RunMode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Instrument controller.
#[derive(Debug, Parser)]
#[command(name = "daq-controller", version, about)]
struct Cli {
    /// Driver to publish
    #[arg(value_enum)]
    driver: DriverKind,

    /// Serial device path, `host:port` or `tcp://host:port`
    #[arg(short = 'd', long)]
    device: Option<String>,

    /// Talk to the driver's built-in emulator instead of hardware
    #[arg(long)]
    simulation: bool,

    /// Address the RPC listener binds to
    #[arg(long)]
    bind: Option<String>,

    /// RPC port [default: the driver's well-known port]
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Device name, used to pick the `[devices.<name>]` table of the config store
    #[arg(long)]
    name: Option<String>,

    /// Config store [default: $CONFIG_DIR/daq-controller/devices.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long a call waits for a busy device, e.g. `10s`
    #[arg(long, value_parser = parse_duration)]
    lock_timeout: Option<Duration>,

    /// How long shutdown waits for in-flight calls, e.g. `5s`
    #[arg(long, value_parser = parse_duration)]
    shutdown_grace: Option<Duration>,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// More logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

impl Cli {
    fn device_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.driver.service_name().to_string())
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            target: self.device.clone(),
            bind: self.bind.clone(),
            port: self.port,
            lock_timeout: self.lock_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// `RUST_LOG` wins; otherwise the level follows `-v`/`-q` around `info`.
fn init_tracing(verbose: u8, quiet: u8) {
    let level = match (i16::from(verbose) - i16::from(quiet)).clamp(-2, 2) {
        -2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let name = cli.device_name();
    let mut config = ControllerConfig::load(&name, cli.config.as_deref())
        .with_context(|| format!("failed to load configuration for '{}'", name))?;
    config.apply(&cli.overrides())?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mode = if cli.simulation {
        RunMode::Simulation
    } else if config.device.target.is_some() {
        RunMode::Live
    } else {
        anyhow::bail!("either --device or --simulation must be given");
    };

    let host = Arc::new(ControllerHost::start(&config, cli.driver, mode, &name).await?);

    let addr = format!("{}:{}", config.rpc.bind, config.rpc_port(cli.driver.default_rpc_port()));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", addr))?;

    let report = host.serve(listener, shutdown_signal()).await?;
    if !report.drained {
        warn!("Calls were still running when the grace period ended");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let link_unavailable = e.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<ControllerError>(),
                    Some(ControllerError::LinkUnavailable { .. })
                )
            });
            if link_unavailable {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
