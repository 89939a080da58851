//! Requests processed by the hub coordinator.
//!
//! Every request carries a `oneshot` reply and the capacity permit of its
//! kind; the permit is released once the coordinator has handled it.

use tokio::sync::{oneshot, OwnedSemaphorePermit};

use super::stats::Stats;
use super::types::{ClientHandle, ClientId, HubError};

#[derive(Debug)]
pub(crate) enum HubMessage {
    Register {
        client: ClientHandle,
        respond_to: oneshot::Sender<()>,
    },
    Deregister {
        client_id: ClientId,
        /// Whether the client was registered
        respond_to: oneshot::Sender<bool>,
    },
    Subscribe {
        client_id: ClientId,
        channel: String,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
    Publish {
        channel: String,
        body: String,
        /// Number of clients the message was queued for
        respond_to: oneshot::Sender<usize>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Stats>,
    },
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub message: HubMessage,
    pub permit: OwnedSemaphorePermit,
}

/// Message kinds with independent mailbox capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Registration,
    Deregistration,
    Subscription,
    Publish,
    Snapshot,
}

impl HubMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register { .. } => MessageKind::Registration,
            Self::Deregister { .. } => MessageKind::Deregistration,
            Self::Subscribe { .. } => MessageKind::Subscription,
            Self::Publish { .. } => MessageKind::Publish,
            Self::Snapshot { .. } => MessageKind::Snapshot,
        }
    }
}
