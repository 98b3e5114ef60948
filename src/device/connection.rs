use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::device::bridge::HardwareBridge;
use crate::device::events::EventSink;
use crate::device::inventory::Inventory;
use crate::device::session::{Session, SessionConsumer};
use crate::device::types::{
    ConnectionState, DescriptorRead, DeviceEvent, PeripheralId, ServiceGraph, WorkflowState,
};
use crate::error::{BridgeError, ConnectError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Wait between establishing the link and enumerating services.
    pub settle_delay: Duration,
    /// Abort the workflow when the signal strength can not be read.
    pub rssi_failure_fatal: bool,
}

#[derive(Debug)]
enum Step {
    Link,
    Settle,
    DiscoverServices,
    SampleSignal {
        graph: ServiceGraph,
    },
    ReadDescriptors {
        graph: ServiceGraph,
        rssi: Option<i16>,
    },
    Handoff {
        graph: ServiceGraph,
        rssi: Option<i16>,
    },
}

#[derive(Default)]
struct Workflows {
    states: HashMap<PeripheralId, WorkflowState>,
    // in-flight workflows whose link dropped while they were suspended
    lost_links: HashSet<PeripheralId>,
}

/// Runs the connect and disconnect workflows, at most one connect per peripheral at a time.
pub struct ConnectionOrchestrator<B: HardwareBridge> {
    bridge: Arc<B>,
    inventory: Arc<Inventory>,
    consumer: Arc<dyn SessionConsumer>,
    events: EventSink,
    settings: ConnectSettings,
    workflows: Mutex<Workflows>,
}

impl<B: HardwareBridge> ConnectionOrchestrator<B> {
    pub fn new(
        bridge: Arc<B>,
        inventory: Arc<Inventory>,
        consumer: Arc<dyn SessionConsumer>,
        events: EventSink,
        settings: ConnectSettings,
    ) -> Self {
        ConnectionOrchestrator {
            bridge,
            inventory,
            consumer,
            events,
            settings,
            workflows: Mutex::new(Workflows::default()),
        }
    }

    pub fn workflow_state(&self, id: &PeripheralId) -> WorkflowState {
        self.workflows().states.get(id).copied().unwrap_or(WorkflowState::Disconnected)
    }

    /// Disconnects a connected peripheral, or runs the connect workflow for a disconnected one.
    /// Returns the workflow state the peripheral ended up in.
    pub async fn toggle_connection(&self, id: &PeripheralId) -> Result<WorkflowState, ConnectError> {
        let record = self.inventory.get(id)
            .ok_or_else(|| ConnectError::UnknownPeripheral(id.clone()))?;

        {
            let mut workflows = self.workflows();
            let current = workflows.states.get(id).copied().unwrap_or(WorkflowState::Disconnected);
            if current.is_in_flight() || record.connection_state() == ConnectionState::Connecting {
                warn!("Connect workflow for {} already in progress", id);
                return Err(ConnectError::InProgress(id.clone()));
            }

            if record.connection_state() == ConnectionState::Disconnected {
                // claim the peripheral before the first suspension point
                workflows.states.insert(id.clone(), WorkflowState::Connecting);
                workflows.lost_links.remove(id);
            }
        }

        match record.connection_state() {
            ConnectionState::Connected => {
                self.disconnect(id).await;
                Ok(WorkflowState::Disconnected)
            },
            _ => self.connect(id).await,
        }
    }

    /// Marks a peripheral disconnected after the stack reported that its link dropped.
    pub fn on_disconnected(&self, id: &PeripheralId) {
        if self.inventory.update(id, |record| record.mark_disconnected()).is_none() {
            debug!("Disconnect event for unknown peripheral {}", id);
        }

        let in_flight = {
            let mut workflows = self.workflows();
            let in_flight = workflows.states.get(id).map_or(false, |state| state.is_in_flight());
            if in_flight {
                workflows.lost_links.insert(id.clone());
            }
            in_flight
        };

        if in_flight {
            warn!("Link to {} dropped during the connect workflow", id);
        } else if self.workflow_state(id) != WorkflowState::Disconnected {
            info!("Peripheral {} disconnected", id);
            self.set_workflow(id, WorkflowState::Disconnected);
        }
    }

    async fn disconnect(&self, id: &PeripheralId) {
        info!("Disconnecting from {}...", id);
        if let Err(err) = self.bridge.disconnect(id).await {
            error!("Error when trying to disconnect {}: {}", id, err);
        }

        self.inventory.update(id, |record| record.mark_disconnected());
        self.set_workflow(id, WorkflowState::Disconnected);
    }

    async fn connect(&self, id: &PeripheralId) -> Result<WorkflowState, ConnectError> {
        self.set_workflow(id, WorkflowState::Connecting);

        let mut step = Some(Step::Link);
        let mut linked = false;
        while let Some(current) = step.take() {
            let linking = matches!(current, Step::Link);
            match self.advance_step(id, current).await {
                Ok(next) => {
                    linked |= linking;
                    step = next;
                },
                Err(err) => {
                    error!("Connect workflow for {} failed: {}", id, err);
                    self.abort(id, linked).await;
                    return Err(err);
                },
            }
        }

        Ok(WorkflowState::Ready)
    }

    async fn advance_step(&self, id: &PeripheralId, step: Step) -> Result<Option<Step>, ConnectError> {
        match step {
            Step::Link => {
                self.inventory.upsert(id, |record| record.mark_connecting());

                info!("Connecting to peripheral {}...", id);
                self.bridge.connect(id).await
                    .map_err(|source| ConnectError::Link { id: id.clone(), source })?;
                // drops reported while connecting belong to an earlier link
                self.workflows().lost_links.remove(id);

                self.inventory.upsert(id, |record| record.mark_connected());
                info!("Connected to {}", id);
                Ok(Some(Step::Settle))
            },
            Step::Settle => {
                // TODO: wait for a readiness signal instead once the bridge can report one
                debug!("Waiting {:?} before service discovery", self.settings.settle_delay);
                sleep(self.settings.settle_delay).await;
                self.check_link(id)?;
                Ok(Some(Step::DiscoverServices))
            },
            Step::DiscoverServices => {
                self.set_workflow(id, WorkflowState::ServiceDiscovery);

                info!("Discovering services of {}...", id);
                let graph = self.bridge.retrieve_services(id).await
                    .map_err(|source| ConnectError::Discovery { id: id.clone(), source })?;
                self.check_link(id)?;

                debug!("{} exposes {} services, {} descriptors", id, graph.services.len(), graph.descriptor_count());
                self.store_graph(id, &graph);
                Ok(Some(Step::SampleSignal { graph }))
            },
            Step::SampleSignal { graph } => {
                let rssi = match self.bridge.read_rssi(id).await {
                    Ok(rssi) => Some(rssi),
                    Err(source) if self.settings.rssi_failure_fatal => {
                        return Err(ConnectError::Sample { id: id.clone(), source });
                    },
                    Err(err) => {
                        warn!("Could not read signal strength of {}: {}", id, err);
                        None
                    },
                };
                self.check_link(id)?;

                if rssi.is_some() {
                    self.inventory.upsert(id, |record| record.rssi = rssi);
                }
                Ok(Some(Step::ReadDescriptors { graph, rssi }))
            },
            Step::ReadDescriptors { mut graph, rssi } => {
                for path in graph.descriptor_paths() {
                    let read = match self.bridge.read_descriptor(id, &path).await {
                        Ok(value) => DescriptorRead::Value(value),
                        Err(err) => {
                            error!("[{}] failed to retrieve descriptor {}: {}", id, path, err);
                            DescriptorRead::Failed(err.to_string())
                        },
                    };
                    graph.set_descriptor_read(&path, read);
                }
                self.check_link(id)?;

                self.store_graph(id, &graph);
                Ok(Some(Step::Handoff { graph, rssi }))
            },
            Step::Handoff { graph, rssi } => {
                let name = self.inventory.get(id)
                    .map(|record| record.name)
                    .unwrap_or_default();

                self.set_workflow(id, WorkflowState::Ready);
                info!("Peripheral {} ready", id);
                self.consumer.complete_session(Session {
                    peripheral_id: id.clone(),
                    name,
                    rssi,
                    service_graph: graph,
                });
                Ok(None)
            },
        }
    }

    async fn abort(&self, id: &PeripheralId, linked: bool) {
        // a link that came up is brought down again
        if linked {
            if let Err(err) = self.bridge.disconnect(id).await {
                warn!("Failed to disconnect {} after aborting: {}", id, err);
            }
        }

        self.inventory.upsert(id, |record| record.mark_disconnected());
        self.workflows().lost_links.remove(id);
        self.set_workflow(id, WorkflowState::Disconnected);
    }

    fn store_graph(&self, id: &PeripheralId, graph: &ServiceGraph) {
        self.inventory.upsert(id, |record| {
            // the record may have been recreated by a new scan while the workflow was suspended
            record.mark_connected();
            record.set_service_graph(graph.clone());
        });
    }

    fn check_link(&self, id: &PeripheralId) -> Result<(), ConnectError> {
        if self.workflows().lost_links.contains(id) {
            return Err(ConnectError::Link { id: id.clone(), source: BridgeError::LinkLost });
        }
        Ok(())
    }

    fn set_workflow(&self, id: &PeripheralId, state: WorkflowState) {
        self.workflows().states.insert(id.clone(), state);
        self.events.send(DeviceEvent::WorkflowChange { id: id.clone(), state });
    }

    fn workflows(&self) -> MutexGuard<'_, Workflows> {
        self.workflows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
