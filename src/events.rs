/// file: src/events.rs
/// description: lifecycle event bus decoupling the client supervisor from presentation
use crate::{error::ConnectionFailure, types::Topic};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connecting { url: String },
    Connected { connection_id: String, resubscribed: usize },
    SubscriptionSent { topic: Topic },
    UnsubscriptionSent { topic: Topic },
    FrameDiscarded { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { reason: String },
    Failed { failure: ConnectionFailure },
    Stopping,
}

// Slow receivers lag and skip; the supervisor never waits on them.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub type EventSender = broadcast::Sender<ClientEvent>;
pub type EventReceiver = broadcast::Receiver<ClientEvent>;

pub fn create_event_channel() -> EventSender {
    let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    sender
}
