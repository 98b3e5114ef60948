use std::sync::{Arc, Mutex, PoisonError};
use log::{debug, info, warn};

use crate::device::bridge::HardwareBridge;
use crate::device::events::EventSink;
use crate::device::inventory::Inventory;
use crate::device::types::{Advertisement, DeviceEvent, ScanRequest, ScanState};
use crate::error::ScanError;

#[derive(Debug)]
struct ScanStatus {
    state: ScanState,
    // StopScan events the bridge still owes us, one per accepted scan request
    pending_stops: u32,
}

/// Starts and stops discovery, and merges advertisements into the inventory.
pub struct ScanController<B: HardwareBridge> {
    bridge: Arc<B>,
    inventory: Arc<Inventory>,
    events: EventSink,
    request: ScanRequest,
    status: Mutex<ScanStatus>,
}

impl<B: HardwareBridge> ScanController<B> {
    pub fn new(bridge: Arc<B>, inventory: Arc<Inventory>, events: EventSink, request: ScanRequest) -> Self {
        ScanController {
            bridge,
            inventory,
            events,
            request,
            status: Mutex::new(ScanStatus { state: ScanState::Idle, pending_stops: 0 }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.status().state
    }

    /// Clears the inventory and starts a scan. Returns `Ok(false)` without doing anything if a
    /// scan is already running.
    pub async fn start_scan(&self) -> Result<bool, ScanError> {
        {
            let mut status = self.status();
            if status.state == ScanState::Scanning {
                debug!("Scan already running, ignoring start request");
                return Ok(false);
            }
            status.state = ScanState::Scanning;
            status.pending_stops += 1;
        }

        self.inventory.clear();
        self.events.send(DeviceEvent::ScanStateChange(ScanState::Scanning));
        info!(
            "Scanning for {}s (services: {:?}, duplicates: {})",
            self.request.duration.as_secs(),
            self.request.service_ids,
            self.request.allow_duplicates,
        );

        if let Err(err) = self.bridge.scan(self.request.clone()).await {
            warn!("Scanning failed {:?}", err);
            {
                let mut status = self.status();
                status.pending_stops = status.pending_stops.saturating_sub(1);
                status.state = ScanState::Idle;
            }
            self.events.send(DeviceEvent::ScanStateChange(ScanState::Idle));
            return Err(err.into());
        }

        Ok(true)
    }

    /// Stops the running scan. The controller is idle as soon as the request is issued; the
    /// `StopScan` event that follows is absorbed by [`on_stop_scan`](Self::on_stop_scan).
    pub async fn stop_scan(&self) -> bool {
        {
            let mut status = self.status();
            if status.state == ScanState::Idle {
                return false;
            }
            status.state = ScanState::Idle;
        }
        self.events.send(DeviceEvent::ScanStateChange(ScanState::Idle));

        if let Err(err) = self.bridge.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }
        true
    }

    pub fn on_discover(&self, advertisement: Advertisement) {
        let id = advertisement.id.clone();
        self.inventory.upsert(&id, |record| record.merge_advertisement(advertisement));
    }

    /// Handles the bridge's `StopScan` event. Stops that belong to an earlier scan, or that
    /// arrive with no scan outstanding, leave the current state alone.
    pub fn on_stop_scan(&self) {
        let became_idle = {
            let mut status = self.status();
            match status.pending_stops {
                0 => {
                    debug!("Ignoring StopScan, no scan outstanding");
                    false
                },
                1 => {
                    status.pending_stops = 0;
                    let was_scanning = status.state == ScanState::Scanning;
                    status.state = ScanState::Idle;
                    was_scanning
                },
                _ => {
                    debug!("Ignoring StopScan from an earlier scan");
                    status.pending_stops -= 1;
                    false
                },
            }
        };

        if became_idle {
            info!("Scan finished, {} peripherals found", self.inventory.len());
            self.events.send(DeviceEvent::ScanStateChange(ScanState::Idle));
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, ScanStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
