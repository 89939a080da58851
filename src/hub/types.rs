//! Client handle and related types

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Metadata;

/// Opaque identity of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A payload published on a channel, as delivered to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub body: String,
}

/// The hub's view of a single connection.
///
/// Equality and hashing only consider the identity. Channel membership is
/// tracked by the hub, never by the handle.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    metadata: Arc<Metadata>,
    connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ChannelMessage>,
}

impl ClientHandle {
    pub fn new(metadata: Metadata, sender: mpsc::Sender<ChannelMessage>) -> Self {
        Self {
            id: ClientId::new(),
            metadata: Arc::new(metadata),
            connected_at: Utc::now(),
            sender,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a message without waiting; returns false when it was dropped
    pub(crate) fn deliver(&self, message: ChannelMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    client_id = %self.id,
                    channel = %message.channel,
                    "Client queue full, message dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Client queue closed");
                false
            }
        }
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl Hash for ClientHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Errors returned by the hub coordinator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub coordinator is not running")]
    Closed,

    #[error("client {0} is not registered")]
    NotRegistered(ClientId),
}
