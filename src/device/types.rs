use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::NO_NAME;

/// Stable hardware identity of a peripheral, as reported by the bluetooth stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Position of a peripheral in the connect workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
}

impl WorkflowState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, WorkflowState::Connecting | WorkflowState::ServiceDiscovery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Raw fields of the last advertisement seen for a peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub tx_power_level: Option<i16>,
}

/// Payload of a `DiscoverPeripheral` event, and of each entry returned when reconciling
/// peripherals that are already connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub data: AdvertisementData,
}

impl Advertisement {
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Advertisement {
            id: id.into(),
            name: None,
            rssi: None,
            data: AdvertisementData::default(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Outcome of reading one descriptor during the connect workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "detail")]
pub enum DescriptorRead {
    Unread,
    Value(Vec<u8>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorSlot {
    pub uuid: Uuid,
    pub read: DescriptorRead,
}

impl DescriptorSlot {
    pub fn unread(uuid: Uuid) -> Self {
        DescriptorSlot { uuid, read: DescriptorRead::Unread }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicNode {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: Vec<String>,
    pub descriptors: Vec<DescriptorSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceNode {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicNode>,
}

/// Position of a slot in the graph, as indices into the service, characteristic and descriptor
/// lists. A service may hold several characteristics with the same uuid, so uuids alone do not
/// identify a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotPosition {
    pub service: usize,
    pub characteristic: usize,
    pub descriptor: usize,
}

/// Address of a single descriptor within a peripheral's service graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPath {
    pub position: SlotPosition,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

impl fmt::Display for DescriptorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]/{}[{}]/{}[{}]",
            self.service, self.position.service,
            self.characteristic, self.position.characteristic,
            self.descriptor, self.position.descriptor,
        )
    }
}

/// Services, characteristics and descriptors exposed by a connected peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceGraph {
    pub services: Vec<ServiceNode>,
}

impl ServiceGraph {
    pub fn descriptor_count(&self) -> usize {
        self.slots().count()
    }

    pub fn failed_descriptor_count(&self) -> usize {
        self.slots()
            .filter(|(_, slot)| matches!(slot.read, DescriptorRead::Failed(_)))
            .count()
    }

    /// Every descriptor in the graph, in service/characteristic order.
    pub fn descriptor_paths(&self) -> Vec<DescriptorPath> {
        self.slots().map(|(path, _)| path).collect()
    }

    /// Stores the outcome of a descriptor read. Returns false if the path is not in the graph,
    /// or if the uuids at its position do not match.
    pub fn set_descriptor_read(&mut self, path: &DescriptorPath, read: DescriptorRead) -> bool {
        let position = path.position;
        let slot = self.services.get_mut(position.service)
            .filter(|service| service.uuid == path.service)
            .and_then(|service| service.characteristics.get_mut(position.characteristic))
            .filter(|characteristic| characteristic.uuid == path.characteristic)
            .and_then(|characteristic| characteristic.descriptors.get_mut(position.descriptor))
            .filter(|slot| slot.uuid == path.descriptor);

        match slot {
            Some(slot) => {
                slot.read = read;
                true
            },
            None => false,
        }
    }

    fn slots(&self) -> impl Iterator<Item = (DescriptorPath, &DescriptorSlot)> {
        self.services.iter().enumerate().flat_map(|(s, service)| {
            service.characteristics.iter().enumerate().flat_map(move |(c, characteristic)| {
                characteristic.descriptors.iter().enumerate().map(move |(d, slot)| {
                    let path = DescriptorPath {
                        position: SlotPosition { service: s, characteristic: c, descriptor: d },
                        service: service.uuid,
                        characteristic: characteristic.uuid,
                        descriptor: slot.uuid,
                    };
                    (path, slot)
                })
            })
        })
    }
}

/// One physical device, as tracked by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub name: String,
    pub advertised_data: AdvertisementData,
    pub rssi: Option<i16>,
    connection_state: ConnectionState,
    service_graph: Option<ServiceGraph>,
    #[serde(skip)]
    pub last_seen_at: Instant,
}

impl PeripheralRecord {
    pub fn new(id: PeripheralId) -> Self {
        PeripheralRecord {
            id,
            name: NO_NAME.to_string(),
            advertised_data: AdvertisementData::default(),
            rssi: None,
            connection_state: ConnectionState::Disconnected,
            service_graph: None,
            last_seen_at: Instant::now(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn service_graph(&self) -> Option<&ServiceGraph> {
        self.service_graph.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Merges an advertisement over this record. The connection state is left alone, and a
    /// missing name keeps whatever name the record already has.
    pub fn merge_advertisement(&mut self, advertisement: Advertisement) {
        if let Some(name) = advertisement.name.filter(|name| !name.is_empty()) {
            self.name = name;
        }
        if advertisement.rssi.is_some() {
            self.rssi = advertisement.rssi;
        }
        self.advertised_data = advertisement.data;
        self.touch();
    }

    pub fn mark_connecting(&mut self) {
        self.connection_state = ConnectionState::Connecting;
        self.service_graph = None;
        self.touch();
    }

    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
        self.touch();
    }

    pub fn mark_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.service_graph = None;
        self.touch();
    }

    /// Stores a service graph. Ignored unless the record is connected.
    pub fn set_service_graph(&mut self, graph: ServiceGraph) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.service_graph = Some(graph);
        true
    }

    fn touch(&mut self) {
        self.last_seen_at = Instant::now();
    }
}

/// Parameters of a scan request sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub service_ids: Vec<Uuid>,
    pub duration: Duration,
    pub allow_duplicates: bool,
    pub options: ScanOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    Aggressive,
    Sticky,
}

/// Hints for stacks that support tuning the radio while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub scan_mode: ScanMode,
    pub match_mode: MatchMode,
}

/// Events pushed by the bluetooth stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    DiscoverPeripheral(Advertisement),
    StopScan,
    DisconnectPeripheral(PeripheralId),
    UpdateValueForCharacteristic {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ConnectPeripheral(PeripheralId),
}

/// Events published to observers of the central.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ScanStateChange(ScanState),
    WorkflowChange {
        id: PeripheralId,
        state: WorkflowState,
    },
    PeripheralConnected(PeripheralId),
    CharacteristicValue {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> ServiceGraph {
        let service = Uuid::from_u128(0x180f);
        let characteristic = Uuid::from_u128(0x2a19);
        ServiceGraph {
            services: vec![ServiceNode {
                uuid: service,
                primary: true,
                characteristics: vec![CharacteristicNode {
                    uuid: characteristic,
                    service_uuid: service,
                    properties: vec!["READ".into()],
                    descriptors: vec![
                        DescriptorSlot::unread(Uuid::from_u128(0x2902)),
                        DescriptorSlot::unread(Uuid::from_u128(0x2901)),
                    ],
                }],
            }],
        }
    }

    #[test]
    fn advertisement_without_name_gets_default() {
        let mut record = PeripheralRecord::new("AA:BB".into());
        record.merge_advertisement(Advertisement::new("AA:BB").with_name(""));
        assert_eq!(record.name, NO_NAME);

        record.merge_advertisement(Advertisement::new("AA:BB").with_name("Sensor1"));
        assert_eq!(record.name, "Sensor1");

        record.merge_advertisement(Advertisement::new("AA:BB"));
        assert_eq!(record.name, "Sensor1");
    }

    #[test]
    fn advertisement_does_not_touch_connection_state() {
        let mut record = PeripheralRecord::new("AA:BB".into());
        record.mark_connected();
        record.merge_advertisement(Advertisement::new("AA:BB"));
        assert_eq!(record.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn service_graph_only_while_connected() {
        let mut record = PeripheralRecord::new("AA:BB".into());
        assert!(!record.set_service_graph(graph()));
        assert!(record.service_graph().is_none());

        record.mark_connected();
        assert!(record.set_service_graph(graph()));
        assert!(record.service_graph().is_some());

        record.mark_disconnected();
        assert!(record.service_graph().is_none());
    }

    #[test]
    fn descriptor_reads_are_stored_per_slot() {
        let mut graph = graph();
        let paths = graph.descriptor_paths();
        assert_eq!(paths.len(), 2);

        assert!(graph.set_descriptor_read(&paths[0], DescriptorRead::Value(vec![1, 0])));
        assert!(graph.set_descriptor_read(&paths[1], DescriptorRead::Failed("timeout".into())));
        assert_eq!(graph.descriptor_count(), 2);
        assert_eq!(graph.failed_descriptor_count(), 1);

        let missing = DescriptorPath { descriptor: Uuid::nil(), ..paths[0] };
        assert!(!graph.set_descriptor_read(&missing, DescriptorRead::Unread));
    }

    #[test]
    fn same_uuid_characteristics_get_their_own_reads() {
        let mut graph = graph();
        let twin = graph.services[0].characteristics[0].clone();
        graph.services[0].characteristics.push(twin);

        let paths = graph.descriptor_paths();
        assert_eq!(paths.len(), 4);
        for (i, path) in paths.iter().enumerate() {
            assert!(graph.set_descriptor_read(path, DescriptorRead::Value(vec![i as u8])));
        }

        let reads: Vec<_> = graph.services[0].characteristics.iter()
            .flat_map(|characteristic| characteristic.descriptors.iter())
            .map(|slot| slot.read.clone())
            .collect();
        assert_eq!(reads, (0..4u8).map(|i| DescriptorRead::Value(vec![i])).collect::<Vec<_>>());
    }

    #[test]
    fn path_outside_the_graph_is_rejected() {
        let mut graph = graph();
        let mut path = graph.descriptor_paths()[0];
        path.position.characteristic = 1;

        assert!(!graph.set_descriptor_read(&path, DescriptorRead::Unread));
    }
}
