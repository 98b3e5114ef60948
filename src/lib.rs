use std::env;
use std::str::FromStr;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::channel::mpsc::UnboundedReceiver;
use futures::{FutureExt, StreamExt};
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleBridge;
use crate::device::central::Central;
use crate::device::session::{session_channel, Session};
use crate::device::types::{DeviceEvent, PeripheralId, ScanState, WorkflowState};
use crate::error::AppRunError;

pub mod device;
pub mod error;
pub mod config;

pub fn init_logging() -> Result<(), fern::InitError> {
    let level = env::var("LOG_LEVEL").ok()
        .and_then(|level| log::LevelFilter::from_str(&level).ok())
        .unwrap_or(log::LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Discovers bluetooth low energy peripherals and connects to them.", long_about = None)]
pub struct Cli {
    /// Only report peripherals advertising this service. May be repeated.
    #[arg(long = "service", global = true)]
    services: Vec<Uuid>,

    /// Length of the scan window in seconds
    #[arg(long, global = true)]
    seconds: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Device(DeviceCommand),

    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Scan once and print every peripheral that was seen
    Scan,

    /// Scan, connect to the given peripheral and print its session
    Connect {
        /// Peripheral id as printed by `scan`
        id: String,
    },

    /// List peripherals that are already connected to this machine
    Connected,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if !self.services.is_empty() {
            config.service_uuids = self.services.clone();
        }
        if let Some(seconds) = self.seconds {
            config.scan_seconds = seconds;
        }
    }
}

async fn read_config(config_io: &ConfigIO) -> Result<Config, AppRunError> {
    match config_io.read().await {
        Ok(config) => Ok(config),
        Err(err) if err.is_file_not_found_error() => {
            info!("Config file does not exist yet, using defaults");
            Ok(Config::default())
        },
        Err(err) => Err(err.into()),
    }
}

async fn scan_until_idle(central: &Central<BtleBridge>) -> Result<(), AppRunError> {
    let mut events = central.subscribe_events();
    if !central.start_scan().await? {
        warn!("A scan was already running");
    }

    while let Some(event) = events.next().await {
        if event == DeviceEvent::ScanStateChange(ScanState::Idle) {
            break;
        }
    }

    info!("Scan finished, {} peripherals found", central.inventory().len());
    Ok(())
}

pub async fn run<I>(args: I) -> Result<(), AppRunError>
where
    I: IntoIterator<Item = String>,
{
    let cli = Cli::parse_from(args);

    let config_io = ConfigIO::new_sync()?;
    let mut config_locker = config_io.locker()?;
    let _config_lock = config_locker.lock()?;

    let mut config = read_config(&config_io).await?;
    cli.apply(&mut config);

    let command = match cli.command {
        Command::Config { save } => {
            if save {
                config_io.save(&config).await?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        },
        Command::Device(command) => command,
    };

    let cancel = CancellationToken::new();
    let (bridge, bridge_events) = BtleBridge::start(cancel.clone()).await
        .map_err(|source| AppRunError::BridgeStartup { source })?;
    let (session_sender, mut sessions) = session_channel();
    let central = Central::new(bridge, bridge_events, Arc::new(session_sender), &config);

    let result = run_command(command, &central, &mut sessions).await;

    central.shutdown().await;
    cancel.cancel();
    result
}

async fn run_command(
    command: DeviceCommand,
    central: &Central<BtleBridge>,
    sessions: &mut UnboundedReceiver<Session>,
) -> Result<(), AppRunError> {
    match command {
        DeviceCommand::Scan => {
            scan_until_idle(central).await?;
            println!("{}", serde_json::to_string_pretty(&central.snapshot())?);
        },
        DeviceCommand::Connect { id } => {
            let id = PeripheralId::new(id);
            scan_until_idle(central).await?;
            if !central.inventory().contains(&id) {
                return Err(AppRunError::NotFound(id));
            }

            let state = central.toggle_connection(&id).await?;
            info!("[{}] workflow ended in state {:?}", id, state);

            // a successful workflow has handed off its session by the time toggle_connection returns
            let session = sessions.next().now_or_never()
                .flatten()
                .ok_or(AppRunError::SessionLost)?;
            println!("{}", serde_json::to_string_pretty(&session)?);

            if central.workflow_state(&id) == WorkflowState::Ready {
                central.toggle_connection(&id).await?;
            }
        },
        DeviceCommand::Connected => {
            let count = central.reconcile_connected().await
                .map_err(|source| AppRunError::Reconcile { source })?;
            info!("{} peripherals are connected", count);
            println!("{}", serde_json::to_string_pretty(&central.snapshot())?);
        },
    }
    Ok(())
}
