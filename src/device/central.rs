use std::sync::{Arc, Mutex, PoisonError};
use futures::channel::mpsc::UnboundedReceiver;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::bridge::HardwareBridge;
use crate::device::connection::ConnectionOrchestrator;
use crate::device::events::EventSink;
use crate::device::inventory::Inventory;
use crate::device::scanner::ScanController;
use crate::device::session::SessionConsumer;
use crate::device::types::{
    BridgeEvent, DeviceEvent, PeripheralId, PeripheralRecord, ScanState, WorkflowState,
};
use crate::error::{BridgeError, ConnectError, ScanError};

struct Components<B: HardwareBridge> {
    bridge: Arc<B>,
    inventory: Arc<Inventory>,
    scanner: ScanController<B>,
    orchestrator: ConnectionOrchestrator<B>,
    events: EventSink,
}

impl<B: HardwareBridge> Components<B> {
    fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::DiscoverPeripheral(advertisement) => {
                self.scanner.on_discover(advertisement);
            },
            BridgeEvent::StopScan => {
                self.scanner.on_stop_scan();
            },
            BridgeEvent::DisconnectPeripheral(id) => {
                self.orchestrator.on_disconnected(&id);
            },
            BridgeEvent::UpdateValueForCharacteristic { id, characteristic, value } => {
                debug!("[{}] received data for characteristic {}: {:?}", id, characteristic, value);
                self.events.send(DeviceEvent::CharacteristicValue { id, characteristic, value });
            },
            BridgeEvent::ConnectPeripheral(id) => {
                info!("[{}] connected.", id);
                self.events.send(DeviceEvent::PeripheralConnected(id));
            },
        }
    }
}

/// Owns the inventory, the scan controller and the connection orchestrator, and feeds them the
/// bridge's events in the order they arrive.
pub struct Central<B: HardwareBridge> {
    components: Arc<Components<B>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<B: HardwareBridge> Central<B> {
    /// Must be called from within a tokio runtime; the event pump is spawned right away.
    pub fn new<S>(bridge: B, bridge_events: S, consumer: Arc<dyn SessionConsumer>, config: &Config) -> Self
    where
        S: Stream<Item = BridgeEvent> + Send + Unpin + 'static,
    {
        let bridge = Arc::new(bridge);
        let inventory = Arc::new(Inventory::new());
        let events = EventSink::default();

        let components = Arc::new(Components {
            scanner: ScanController::new(bridge.clone(), inventory.clone(), events.clone(), config.scan_request()),
            orchestrator: ConnectionOrchestrator::new(
                bridge.clone(),
                inventory.clone(),
                consumer,
                events.clone(),
                config.connect_settings(),
            ),
            bridge,
            inventory,
            events,
        });

        let cancel = CancellationToken::new();
        let pump = event_pump_task(cancel.child_token(), bridge_events, components.clone());

        Central {
            components,
            cancel,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub async fn start_scan(&self) -> Result<bool, ScanError> {
        self.components.scanner.start_scan().await
    }

    pub async fn stop_scan(&self) -> bool {
        self.components.scanner.stop_scan().await
    }

    pub async fn toggle_connection(&self, id: &PeripheralId) -> Result<WorkflowState, ConnectError> {
        self.components.orchestrator.toggle_connection(id).await
    }

    /// Adds peripherals the stack reports as already connected to the inventory, marked as
    /// connected. Returns how many there were.
    pub async fn reconcile_connected(&self) -> Result<usize, BridgeError> {
        let connected = match self.components.bridge.connected_peripherals().await {
            Ok(connected) => connected,
            Err(err) => {
                warn!("Unable to retrieve connected peripherals: {}", err);
                return Err(err);
            },
        };

        if connected.is_empty() {
            warn!("No connected peripherals found.");
        }

        let count = connected.len();
        for advertisement in connected {
            let id = advertisement.id.clone();
            self.components.inventory.upsert(&id, |record| {
                record.merge_advertisement(advertisement);
                record.mark_connected();
            });
        }
        Ok(count)
    }

    pub fn scan_state(&self) -> ScanState {
        self.components.scanner.state()
    }

    pub fn workflow_state(&self, id: &PeripheralId) -> WorkflowState {
        self.components.orchestrator.workflow_state(id)
    }

    pub fn inventory(&self) -> &Inventory {
        &self.components.inventory
    }

    pub fn snapshot(&self) -> Vec<PeripheralRecord> {
        self.components.inventory.snapshot()
    }

    pub fn subscribe_inventory(&self) -> watch::Receiver<Vec<PeripheralRecord>> {
        self.components.inventory.subscribe()
    }

    pub fn subscribe_events(&self) -> UnboundedReceiver<DeviceEvent> {
        self.components.events.subscribe()
    }

    /// Stops the event pump and waits for it to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = pump {
            info!("Waiting for event pump to stop");
            if let Err(err) = handle.await {
                warn!("Event pump ended abnormally: {}", err);
            }
        }
    }
}

impl<B: HardwareBridge> Drop for Central<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn event_pump_task<B, S>(cancel: CancellationToken, mut bridge_events: S, components: Arc<Components<B>>) -> JoinHandle<()>
where
    B: HardwareBridge,
    S: Stream<Item = BridgeEvent> + Send + Unpin + 'static,
{
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = bridge_events.next() => match event {
                    Some(event) => components.handle_event(event),
                    None => {
                        info!("Bridge event stream ended");
                        break 'mainloop;
                    },
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc::{unbounded, UnboundedSender};

    use super::*;
    use crate::device::fake::{two_service_graph, FakeBridge, Script};
    use crate::device::session::{session_channel, Session};
    use crate::device::types::{Advertisement, ConnectionState};

    struct Harness {
        central: Central<FakeBridge>,
        bridge_tx: UnboundedSender<BridgeEvent>,
        sessions: UnboundedReceiver<Session>,
        events: UnboundedReceiver<DeviceEvent>,
    }

    fn harness(script: Script) -> Harness {
        let (bridge_tx, bridge_rx) = unbounded();
        let (sender, sessions) = session_channel();
        let central = Central::new(
            FakeBridge::new(Script { graph: two_service_graph(), rssi: -70, ..script }),
            bridge_rx,
            Arc::new(sender),
            &Config::default(),
        );
        let events = central.subscribe_events();
        Harness { central, bridge_tx, sessions, events }
    }

    impl Harness {
        fn emit(&self, event: BridgeEvent) {
            self.bridge_tx.unbounded_send(event).expect("pump alive");
        }

        async fn next_matching(&mut self, wanted: &DeviceEvent) {
            while let Some(event) = self.events.next().await {
                if &event == wanted {
                    return;
                }
            }
            panic!("event stream ended before {:?}", wanted);
        }
    }

    #[tokio::test]
    async fn discovery_events_fill_the_inventory() {
        let mut h = harness(Script::default());
        h.central.start_scan().await.expect("scan");

        h.emit(BridgeEvent::DiscoverPeripheral(Advertisement::new("AA:BB").with_name("")));
        h.emit(BridgeEvent::DiscoverPeripheral(Advertisement::new("AA:BB").with_name("Sensor1")));
        h.emit(BridgeEvent::DiscoverPeripheral(Advertisement::new("CC:DD")));
        h.emit(BridgeEvent::StopScan);
        h.next_matching(&DeviceEvent::ScanStateChange(ScanState::Idle)).await;

        let mut snapshot = h.central.snapshot();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "Sensor1");
        assert_eq!(snapshot[1].name, "NO NAME");
        assert_eq!(h.central.scan_state(), ScanState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_then_connect_hands_off_session() {
        let mut h = harness(Script::default());
        h.central.start_scan().await.expect("scan");
        h.emit(BridgeEvent::DiscoverPeripheral(Advertisement::new("AA:BB").with_name("Sensor1")));
        h.emit(BridgeEvent::StopScan);
        h.next_matching(&DeviceEvent::ScanStateChange(ScanState::Idle)).await;

        let state = h.central.toggle_connection(&"AA:BB".into()).await.expect("connect");

        assert_eq!(state, WorkflowState::Ready);
        let session = h.sessions.next().await.expect("session");
        assert_eq!(session.name, "Sensor1");
        assert_eq!(session.rssi, Some(-70));
        assert_eq!(session.service_graph.descriptor_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_event_marks_record_disconnected() {
        let mut h = harness(Script::default());
        h.central.inventory().upsert(&"AA:BB".into(), |_| ());
        h.central.toggle_connection(&"AA:BB".into()).await.expect("connect");

        h.emit(BridgeEvent::DisconnectPeripheral("AA:BB".into()));
        h.next_matching(&DeviceEvent::WorkflowChange {
            id: "AA:BB".into(),
            state: WorkflowState::Disconnected,
        }).await;

        let record = h.central.inventory().get(&"AA:BB".into()).expect("record");
        assert_eq!(record.connection_state(), ConnectionState::Disconnected);
        assert!(record.service_graph().is_none());
    }

    #[tokio::test]
    async fn disconnect_event_for_unknown_peripheral_adds_nothing() {
        let mut h = harness(Script::default());

        h.emit(BridgeEvent::DisconnectPeripheral("AA:BB".into()));
        h.emit(BridgeEvent::ConnectPeripheral("CC:DD".into()));
        h.next_matching(&DeviceEvent::PeripheralConnected("CC:DD".into())).await;

        assert!(h.central.inventory().is_empty());
    }

    #[tokio::test]
    async fn characteristic_updates_are_forwarded() {
        let mut h = harness(Script::default());
        let characteristic = uuid::Uuid::from_u128(0x2a37);

        h.emit(BridgeEvent::UpdateValueForCharacteristic {
            id: "AA:BB".into(),
            characteristic,
            value: vec![0x06, 0x48],
        });

        h.next_matching(&DeviceEvent::CharacteristicValue {
            id: "AA:BB".into(),
            characteristic,
            value: vec![0x06, 0x48],
        }).await;
    }

    #[tokio::test]
    async fn reconcile_marks_connected_peripherals() {
        let connected = vec![Advertisement::new("AA:BB").with_name("Sensor1")];
        let h = harness(Script { connected, ..Script::default() });

        assert_eq!(h.central.reconcile_connected().await.expect("reconcile"), 1);

        let record = h.central.inventory().get(&"AA:BB".into()).expect("record");
        assert_eq!(record.connection_state(), ConnectionState::Connected);
        assert_eq!(record.name, "Sensor1");
    }

    #[tokio::test]
    async fn shutdown_twice_is_clean() {
        let h = harness(Script::default());
        h.central.shutdown().await;
        h.central.shutdown().await;
    }
}
