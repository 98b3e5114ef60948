use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{info, warn};
use serde::Serialize;

use crate::device::types::{PeripheralId, ServiceGraph};

/// Everything a consumer needs once a peripheral finished the connect workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub peripheral_id: PeripheralId,
    pub name: String,
    pub rssi: Option<i16>,
    pub service_graph: ServiceGraph,
}

/// Receives completed sessions. Called once per successful connect workflow; handling the same
/// peripheral twice is up to the implementation.
pub trait SessionConsumer: Send + Sync + 'static {
    fn complete_session(&self, session: Session);
}

/// Forwards sessions over a channel.
#[derive(Clone)]
pub struct SessionSender {
    sender: UnboundedSender<Session>,
}

pub fn session_channel() -> (SessionSender, UnboundedReceiver<Session>) {
    let (sender, receiver) = unbounded();
    (SessionSender { sender }, receiver)
}

impl SessionConsumer for SessionSender {
    fn complete_session(&self, session: Session) {
        let id = session.peripheral_id.clone();
        info!("Session ready for {} ({} services)", id, session.service_graph.services.len());

        if self.sender.unbounded_send(session).is_err() {
            warn!("Session for {} dropped, nobody is listening", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn sender_delivers_session() {
        let (sender, mut receiver) = session_channel();
        sender.complete_session(Session {
            peripheral_id: "AA:BB".into(),
            name: "Sensor1".into(),
            rssi: Some(-60),
            service_graph: ServiceGraph::default(),
        });

        let session = receiver.next().await.expect("session");
        assert_eq!(session.peripheral_id, PeripheralId::from("AA:BB"));
        assert_eq!(session.rssi, Some(-60));
    }

    #[test]
    fn sender_without_receiver_does_not_panic() {
        let (sender, receiver) = session_channel();
        drop(receiver);
        sender.complete_session(Session {
            peripheral_id: "AA:BB".into(),
            name: "Sensor1".into(),
            rssi: None,
            service_graph: ServiceGraph::default(),
        });
    }
}
