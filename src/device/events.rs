use std::sync::{Arc, Mutex, PoisonError};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

use crate::device::types::DeviceEvent;

/// Fans [`DeviceEvent`]s out to every subscriber. Subscribers that went away are dropped on the
/// next send.
#[derive(Clone, Default)]
pub struct EventSink {
    senders: Arc<Mutex<Vec<UnboundedSender<DeviceEvent>>>>,
}

impl EventSink {
    pub fn subscribe(&self) -> UnboundedReceiver<DeviceEvent> {
        let (sender, receiver) = unbounded();
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).push(sender);
        receiver
    }

    pub fn send(&self, event: DeviceEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }
}
