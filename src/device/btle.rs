use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::bridge::HardwareBridge;
use crate::device::types::{
    Advertisement, AdvertisementData, BridgeEvent, CharacteristicNode, DescriptorPath, DescriptorSlot,
    PeripheralId, ScanRequest, ServiceGraph, ServiceNode,
};
use crate::error::BridgeError;

#[derive(Debug, Default)]
struct ScanWindow {
    active: bool,
    generation: u64,
    services: Vec<uuid::Uuid>,
    allow_duplicates: bool,
    // cancelled to end the window early
    stop: Option<CancellationToken>,
}

struct Shared {
    adapter: Adapter,
    peripherals: RwLock<HashMap<PeripheralId, Peripheral>>,
    scan: Mutex<ScanWindow>,
    notifications: Mutex<HashMap<PeripheralId, CancellationToken>>,
    sender: UnboundedSender<BridgeEvent>,
}

impl Shared {
    fn emit(&self, event: BridgeEvent) {
        if self.sender.unbounded_send(event).is_err() {
            debug!("Bridge event dropped, nobody is listening");
        }
    }

    fn scan(&self) -> std::sync::MutexGuard<'_, ScanWindow> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_notifications(&self, id: &PeripheralId) {
        let token = self.notifications.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        if let Some(token) = token {
            token.cancel();
        }
    }
}

/// [`HardwareBridge`] on top of the first bluetooth adapter btleplug finds.
pub struct BtleBridge {
    // dropping the manager can tear down the platform session on some backends
    _manager: Manager,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl BtleBridge {
    /// Opens the first adapter and starts translating its events. Fails when bluetooth is not
    /// available at all.
    pub async fn start(cancel: CancellationToken) -> Result<(BtleBridge, UnboundedReceiver<BridgeEvent>), BridgeError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(BridgeError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let central_events = adapter.events().await?;
        let (sender, receiver) = unbounded();

        let shared = Arc::new(Shared {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            scan: Mutex::new(ScanWindow::default()),
            notifications: Mutex::new(HashMap::new()),
            sender,
        });

        adapter_events_task(cancel.child_token(), central_events, shared.clone());

        Ok((BtleBridge { _manager: manager, shared, cancel }, receiver))
    }

    async fn lookup(&self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        if let Some(peripheral) = self.shared.peripherals.read().await.get(id) {
            return Ok(peripheral.clone());
        }

        // peripherals that were connected before we started never show up in a scan
        for peripheral in self.shared.adapter.peripherals().await? {
            if &peripheral_key(&peripheral) == id {
                self.shared.peripherals.write().await.insert(id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(BridgeError::UnknownPeripheral(id.clone()))
    }
}

impl Drop for BtleBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl HardwareBridge for BtleBridge {
    async fn scan(&self, request: ScanRequest) -> Result<(), BridgeError> {
        debug!("Scan options {:?} are not supported by this backend", request.options);

        let stop = CancellationToken::new();
        let generation = {
            let mut window = self.shared.scan();
            if let Some(previous) = window.stop.replace(stop.clone()) {
                previous.cancel();
            }
            window.generation += 1;
            window.active = true;
            window.services = request.service_ids.clone();
            window.allow_duplicates = request.allow_duplicates;
            window.generation
        };

        let filter = ScanFilter {
            services: request.service_ids.clone(),
        };
        if let Err(err) = self.shared.adapter.start_scan(filter).await {
            let mut window = self.shared.scan();
            window.active = false;
            window.stop = None;
            return Err(err.into());
        }

        scan_window_task(stop, generation, request, self.shared.clone());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BridgeError> {
        let stop = self.shared.scan().stop.take();
        if let Some(stop) = stop {
            stop.cancel();
        }
        self.shared.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BridgeError> {
        let peripheral = self.lookup(id).await?;
        peripheral.connect().await.map_err(stack_error)?;

        let token = self.cancel.child_token();
        let previous = self.shared.notifications.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        forward_notifications_task(token, &peripheral, id.clone(), self.shared.sender.clone());
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), BridgeError> {
        self.shared.stop_notifications(id);
        let peripheral = self.lookup(id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceGraph, BridgeError> {
        let peripheral = self.lookup(id).await?;
        peripheral.discover_services().await.map_err(stack_error)?;

        let services = peripheral.services()
            .into_iter()
            .map(|service| ServiceNode {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service.characteristics.iter().map(characteristic_node).collect(),
            })
            .collect();

        Ok(ServiceGraph { services })
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16, BridgeError> {
        // btleplug has no explicit rssi request, the last reported value is the best we have
        let peripheral = self.lookup(id).await?;
        peripheral.properties().await?
            .and_then(|properties| properties.rssi)
            .ok_or_else(|| BridgeError::NoSignal(id.clone()))
    }

    async fn read_descriptor(&self, id: &PeripheralId, path: &DescriptorPath) -> Result<Vec<u8>, BridgeError> {
        let peripheral = self.lookup(id).await?;
        // same iteration order as retrieve_services, so positions line up
        let position = path.position;
        let descriptor = peripheral.services()
            .into_iter()
            .nth(position.service)
            .filter(|service| service.uuid == path.service)
            .and_then(|service| service.characteristics.into_iter().nth(position.characteristic))
            .filter(|characteristic| characteristic.uuid == path.characteristic)
            .and_then(|characteristic| characteristic.descriptors.into_iter().nth(position.descriptor))
            .filter(|descriptor| descriptor.uuid == path.descriptor)
            .ok_or_else(|| BridgeError::MissingDescriptor(path.to_string()))?;

        peripheral.read_descriptor(&descriptor).await.map_err(stack_error)
    }

    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, BridgeError> {
        let mut connected = Vec::new();

        for peripheral in self.shared.adapter.peripherals().await? {
            match peripheral.is_connected().await {
                Ok(true) => {},
                Ok(false) => continue,
                Err(err) => {
                    warn!("Error checking for connection state: {:?}", err);
                    continue;
                },
            }

            if let Some(advertisement) = advertisement_for(&peripheral).await {
                self.shared.peripherals.write().await.insert(advertisement.id.clone(), peripheral.clone());
                connected.push(advertisement);
            }
        }

        Ok(connected)
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn peripheral_key(peripheral: &Peripheral) -> PeripheralId {
    // CoreBluetooth hides hardware addresses
    PeripheralId::new(format!("{:?}", peripheral.id()))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn peripheral_key(peripheral: &Peripheral) -> PeripheralId {
    PeripheralId::new(peripheral.address().to_string())
}

// Refusals by the stack or the peripheral are reported as such, everything else stays a
// btleplug error.
fn stack_error(err: btleplug::Error) -> BridgeError {
    match err {
        btleplug::Error::PermissionDenied => BridgeError::Rejected("permission denied".to_string()),
        btleplug::Error::NotSupported(reason) => BridgeError::Rejected(reason),
        err => err.into(),
    }
}

fn property_names(flags: CharPropFlags) -> Vec<String> {
    [
        (CharPropFlags::BROADCAST, "BROADCAST"),
        (CharPropFlags::READ, "READ"),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, "WRITE_WITHOUT_RESPONSE"),
        (CharPropFlags::WRITE, "WRITE"),
        (CharPropFlags::NOTIFY, "NOTIFY"),
        (CharPropFlags::INDICATE, "INDICATE"),
        (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, "AUTHENTICATED_SIGNED_WRITES"),
    ]
        .into_iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect()
}

fn characteristic_node(characteristic: &Characteristic) -> CharacteristicNode {
    CharacteristicNode {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: property_names(characteristic.properties),
        descriptors: characteristic.descriptors.iter()
            .map(|descriptor| DescriptorSlot::unread(descriptor.uuid))
            .collect(),
    }
}

async fn advertisement_for(peripheral: &Peripheral) -> Option<Advertisement> {
    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            warn!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => Some(Advertisement {
            id: peripheral_key(peripheral),
            name: properties.local_name.clone(),
            rssi: properties.rssi,
            data: AdvertisementData {
                local_name: properties.local_name,
                services: properties.services,
                manufacturer_data: properties.manufacturer_data.into_iter().collect(),
                service_data: properties.service_data.into_iter().collect(),
                tx_power_level: properties.tx_power_level,
            },
        }),
    }
}

async fn report_discovery(shared: &Shared, id: &btleplug::platform::PeripheralId, update: bool) {
    let (services, allow_duplicates) = {
        let window = shared.scan();
        if !window.active {
            return;
        }
        (window.services.clone(), window.allow_duplicates)
    };
    if update && !allow_duplicates {
        return;
    }

    let peripheral = match shared.adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral: {}", err);
            return;
        },
    };

    let Some(advertisement) = advertisement_for(&peripheral).await else {
        return;
    };

    // Some environments ignore the filter, so make sure to check the service uuid again
    if !services.is_empty() && !advertisement.data.services.iter().any(|uuid| services.contains(uuid)) {
        return;
    }

    shared.peripherals.write().await.insert(advertisement.id.clone(), peripheral);
    shared.emit(BridgeEvent::DiscoverPeripheral(advertisement));
}

async fn known_key(shared: &Shared, id: &btleplug::platform::PeripheralId) -> Option<PeripheralId> {
    match shared.adapter.peripheral(id).await {
        Ok(peripheral) => Some(peripheral_key(&peripheral)),
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral: {}", err);
            None
        },
    }
}

fn adapter_events_task(
    cancel: CancellationToken,
    mut central_events: BoxStream<'static, CentralEvent>,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = central_events.next() => match event {
                    None => break 'mainloop,
                    Some(CentralEvent::DeviceDiscovered(id)) => report_discovery(&shared, &id, false).await,
                    Some(CentralEvent::DeviceUpdated(id)) => report_discovery(&shared, &id, true).await,
                    Some(CentralEvent::DeviceConnected(id)) => {
                        if let Some(key) = known_key(&shared, &id).await {
                            shared.emit(BridgeEvent::ConnectPeripheral(key));
                        }
                    },
                    Some(CentralEvent::DeviceDisconnected(id)) => {
                        if let Some(key) = known_key(&shared, &id).await {
                            shared.stop_notifications(&key);
                            shared.emit(BridgeEvent::DisconnectPeripheral(key));
                        }
                    },
                    Some(_) => {},
                },
            }
        }
        debug!("Adapter event task stopped");
    })
}

// Ends the scan window after its duration, or when `stop` is cancelled, and reports exactly one
// StopScan for it.
fn scan_window_task(stop: CancellationToken, generation: u64, request: ScanRequest, shared: Arc<Shared>) -> JoinHandle<()> {
    spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {},
            _ = sleep(request.duration) => {
                if let Err(err) = shared.adapter.stop_scan().await {
                    warn!("Failed to stop scanning: {}", err);
                }
            },
        }

        {
            let mut window = shared.scan();
            // a newer scan owns the window now
            if window.generation == generation {
                window.active = false;
                window.stop = None;
            }
        }
        shared.emit(BridgeEvent::StopScan);
    })
}

fn forward_notifications_task(
    cancel: CancellationToken,
    peripheral: &Peripheral,
    id: PeripheralId,
    sender: UnboundedSender<BridgeEvent>,
) -> JoinHandle<()> {
    let peripheral = peripheral.clone();

    spawn(async move {
        let mut notification_stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Could not listen for notifications from {}: {}", id, err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(data) = notification_stream.next() => {
                    let event = BridgeEvent::UpdateValueForCharacteristic {
                        id: id.clone(),
                        characteristic: data.uuid,
                        value: data.value,
                    };
                    if sender.unbounded_send(event).is_err() {
                        break 'mainloop;
                    }
                },
            }
        }
    })
}
