//! Upstream publish/subscribe store abstraction

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the in-process message bus
const MEMORY_BUS_CAPACITY: usize = 1024;

/// A message published upstream on a named channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Upstream store unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream message stream ended")]
    StreamEnded,
}

/// An external store that can be subscribed to by channel name
#[async_trait]
pub trait UpstreamStore: Send + Sync {
    /// Store name used in logs
    fn name(&self) -> &'static str;

    /// Open a fresh subscription connection
    async fn connect(&self) -> Result<Box<dyn UpstreamConnection>, RelayError>;
}

/// One live subscription connection to an upstream store
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Start receiving messages published on `channel`
    async fn subscribe(&mut self, channel: &str) -> Result<(), RelayError>;

    /// Wait for the next message on any subscribed channel.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Result<UpstreamMessage, RelayError>;
}

/// In-process store backed by a broadcast bus.
///
/// Used for single-instance deployments and tests. It can be marked
/// unavailable to exercise reconnection.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    bus: broadcast::Sender<UpstreamMessage>,
    available: AtomicBool,
    /// Every channel any connection subscribed to
    subscriptions: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                bus,
                available: AtomicBool::new(true),
                subscriptions: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Publish a message; returns the number of open connections
    pub fn publish(&self, channel: impl Into<String>, payload: impl Into<String>) -> usize {
        self.inner
            .bus
            .send(UpstreamMessage {
                channel: channel.into(),
                payload: payload.into(),
            })
            .unwrap_or(0)
    }

    /// Refuse or accept new connections
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.subscriptions.read().await.contains(channel)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamConnection>, RelayError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable("memory store is offline".to_string()));
        }

        Ok(Box::new(MemoryConnection {
            store: self.inner.clone(),
            receiver: self.inner.bus.subscribe(),
            channels: HashSet::new(),
        }))
    }
}

struct MemoryConnection {
    store: Arc<MemoryInner>,
    receiver: broadcast::Receiver<UpstreamMessage>,
    channels: HashSet<String>,
}

#[async_trait]
impl UpstreamConnection for MemoryConnection {
    async fn subscribe(&mut self, channel: &str) -> Result<(), RelayError> {
        self.channels.insert(channel.to_string());
        self.store
            .subscriptions
            .write()
            .await
            .insert(channel.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<UpstreamMessage, RelayError> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.channels.contains(&message.channel) => return Ok(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Memory store subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RelayError::StreamEnded),
            }
        }
    }
}
