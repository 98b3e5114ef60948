use std::fmt::Display;
use std::io;
use std::str::Utf8Error;
use log::error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::PeripheralId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Errors reported by a [`HardwareBridge`](crate::device::bridge::HardwareBridge) request.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the bluetooth adapter")]
    UnknownPeripheral(PeripheralId),

    #[error("Descriptor {0} is not present in the service graph")]
    MissingDescriptor(String),

    #[error("Peripheral {0} did not report a signal strength")]
    NoSignal(PeripheralId),

    #[error("The link to the peripheral was lost")]
    LinkLost,

    #[error("Request rejected by the bluetooth stack: {0}")]
    Rejected(String),
}

/// Fatal outcomes of a connect workflow. Descriptor read failures are not listed here, they are
/// recorded in the service graph instead.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Link failure for {id}: {source}")]
    Link { id: PeripheralId, source: BridgeError },

    #[error("Service discovery failed for {id}: {source}")]
    Discovery { id: PeripheralId, source: BridgeError },

    #[error("Reading signal strength failed for {id}: {source}")]
    Sample { id: PeripheralId, source: BridgeError },

    #[error("A connect workflow for {0} is already in progress")]
    InProgress(PeripheralId),

    #[error("Peripheral {0} is not in the inventory")]
    UnknownPeripheral(PeripheralId),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to start scanning: {source}")]
    Start { #[from] source: BridgeError },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Bluetooth could not be initialized: {source}")]
    BridgeStartup { source: BridgeError },

    #[error("{source}")]
    Scan { #[from] source: ScanError },

    #[error("{source}")]
    Connect { #[from] source: ConnectError },

    #[error("Failed to retrieve connected peripherals: {source}")]
    Reconcile { source: BridgeError },

    #[error("Peripheral {0} was not found during the scan")]
    NotFound(PeripheralId),

    #[error("The session consumer went away before a session was handed off")]
    SessionLost,

    #[error("Failed to encode output: {source}")]
    Output { #[from] source: serde_json::Error },
}

pub fn error_report<T: Display>(message: &str, error: &T) {
    let message = format!("{}: {}", message, error);
    error!("{}", &message);
    eprintln!("{}", &message);
}
