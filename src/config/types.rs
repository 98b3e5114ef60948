use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::connection::ConnectSettings;
use crate::device::constants::{ALLOW_DUPLICATES, SCAN_SECONDS, SETTLE_DELAY};
use crate::device::types::{MatchMode, ScanMode, ScanOptions, ScanRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Only peripherals advertising one of these services are reported. Empty means all.
    pub service_uuids: Vec<Uuid>,
    pub scan_seconds: u64,
    pub allow_duplicates: bool,
    pub settle_delay_ms: u64,
    pub rssi_failure_fatal: bool,
    pub scan_mode: ScanMode,
    pub match_mode: MatchMode,
}

impl Config {
    pub fn scan_request(&self) -> ScanRequest {
        ScanRequest {
            service_ids: self.service_uuids.clone(),
            duration: Duration::from_secs(self.scan_seconds),
            allow_duplicates: self.allow_duplicates,
            options: ScanOptions {
                scan_mode: self.scan_mode,
                match_mode: self.match_mode,
            },
        }
    }

    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            rssi_failure_fatal: self.rssi_failure_fatal,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_uuids: Vec::new(),
            scan_seconds: SCAN_SECONDS,
            allow_duplicates: ALLOW_DUPLICATES,
            settle_delay_ms: SETTLE_DELAY,
            rssi_failure_fatal: true,
            scan_mode: ScanMode::LowLatency,
            match_mode: MatchMode::Sticky,
        }
    }
}
