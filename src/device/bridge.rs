use async_trait::async_trait;

use crate::device::types::{Advertisement, DescriptorPath, PeripheralId, ScanRequest, ServiceGraph};
use crate::error::BridgeError;

/// Requests the central makes of the bluetooth stack.
///
/// Events flow the other way, as a stream of
/// [`BridgeEvent`](crate::device::types::BridgeEvent)s handed to the central when it is created.
/// Every accepted [`scan`](HardwareBridge::scan) must eventually produce exactly one
/// `BridgeEvent::StopScan`, either when its duration runs out or after
/// [`stop_scan`](HardwareBridge::stop_scan).
#[async_trait]
pub trait HardwareBridge: Send + Sync + 'static {
    async fn scan(&self, request: ScanRequest) -> Result<(), BridgeError>;

    async fn stop_scan(&self) -> Result<(), BridgeError>;

    async fn connect(&self, id: &PeripheralId) -> Result<(), BridgeError>;

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), BridgeError>;

    /// Enumerates services, characteristics and descriptors. Descriptor slots come back unread.
    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceGraph, BridgeError>;

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16, BridgeError>;

    async fn read_descriptor(&self, id: &PeripheralId, path: &DescriptorPath) -> Result<Vec<u8>, BridgeError>;

    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, BridgeError>;
}
