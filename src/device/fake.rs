//! A scripted in-memory bridge for unit tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use uuid::Uuid;

use crate::device::bridge::HardwareBridge;
use crate::device::types::{
    Advertisement, CharacteristicNode, DescriptorPath, DescriptorSlot, PeripheralId, ScanRequest,
    ServiceGraph, ServiceNode,
};
use crate::error::BridgeError;

#[derive(Default)]
pub(crate) struct Script {
    pub fail_scan: bool,
    pub fail_stop_scan: bool,
    pub fail_connect: bool,
    pub connect_delay: Duration,
    pub fail_disconnect: bool,
    pub fail_services: bool,
    pub fail_rssi: bool,
    pub failing_descriptors: Vec<Uuid>,
    pub graph: ServiceGraph,
    pub rssi: i16,
    pub connected: Vec<Advertisement>,
}

#[derive(Default)]
pub(crate) struct FakeBridge {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl FakeBridge {
    pub fn new(script: Script) -> Self {
        FakeBridge {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(prefix)).count()
    }

    pub fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    fn check(&self, failing: impl FnOnce(&Script) -> bool) -> Result<(), BridgeError> {
        if failing(&self.script.lock().unwrap_or_else(PoisonError::into_inner)) {
            return Err(BridgeError::Rejected("scripted failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareBridge for FakeBridge {
    async fn scan(&self, request: ScanRequest) -> Result<(), BridgeError> {
        self.record(format!("scan {}s", request.duration.as_secs()));
        self.check(|s| s.fail_scan)
    }

    async fn stop_scan(&self) -> Result<(), BridgeError> {
        self.record("stop_scan".into());
        self.check(|s| s.fail_stop_scan)
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BridgeError> {
        self.record(format!("connect {}", id));
        let delay = self.script.lock().unwrap_or_else(PoisonError::into_inner).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(|s| s.fail_connect)
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), BridgeError> {
        self.record(format!("disconnect {}", id));
        self.check(|s| s.fail_disconnect)
    }

    async fn retrieve_services(&self, id: &PeripheralId) -> Result<ServiceGraph, BridgeError> {
        self.record(format!("retrieve_services {}", id));
        self.check(|s| s.fail_services)?;
        Ok(self.script.lock().unwrap_or_else(PoisonError::into_inner).graph.clone())
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16, BridgeError> {
        self.record(format!("read_rssi {}", id));
        self.check(|s| s.fail_rssi)?;
        Ok(self.script.lock().unwrap_or_else(PoisonError::into_inner).rssi)
    }

    async fn read_descriptor(&self, id: &PeripheralId, path: &DescriptorPath) -> Result<Vec<u8>, BridgeError> {
        self.record(format!("read_descriptor {} {}", id, path.descriptor));
        self.check(|s| s.failing_descriptors.contains(&path.descriptor))?;
        Ok(path.descriptor.as_bytes()[14..].to_vec())
    }

    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, BridgeError> {
        self.record("connected_peripherals".into());
        Ok(self.script.lock().unwrap_or_else(PoisonError::into_inner).connected.clone())
    }
}

/// Two services with three descriptors between them.
pub(crate) fn two_service_graph() -> ServiceGraph {
    let battery = Uuid::from_u128(0x180f);
    let heart_rate = Uuid::from_u128(0x180d);
    let characteristic = |service: Uuid, uuid: u128, descriptors: &[u128]| CharacteristicNode {
        uuid: Uuid::from_u128(uuid),
        service_uuid: service,
        properties: vec!["READ".into(), "NOTIFY".into()],
        descriptors: descriptors.iter().map(|d| DescriptorSlot::unread(Uuid::from_u128(*d))).collect(),
    };

    ServiceGraph {
        services: vec![
            ServiceNode {
                uuid: battery,
                primary: true,
                characteristics: vec![characteristic(battery, 0x2a19, &[0x2902, 0x2904])],
            },
            ServiceNode {
                uuid: heart_rate,
                primary: true,
                characteristics: vec![characteristic(heart_rate, 0x2a37, &[0x2901])],
            },
        ],
    }
}
