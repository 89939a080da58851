//! Hub coordinator - the single owner of connection and channel state.
//!
//! All mutations go through one task that handles requests in arrival order,
//! so the connection count and the membership table need no locks. Callers
//! talk to it through the cloneable [`Hub`] handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::config::HubConfig;
use crate::metrics::{CHANNELS_ACTIVE, CLIENTS_CONNECTED, MESSAGES_DELIVERED_TOTAL, MESSAGES_DROPPED_TOTAL, SUBSCRIPTIONS_TOTAL};
use crate::relay::UpstreamSubscriptions;

use super::messages::{Envelope, HubMessage, MessageKind};
use super::stats::Stats;
use super::types::{ChannelMessage, ClientHandle, ClientId, HubError};

/// Per-kind mailbox capacity
struct Capacity {
    registration: Arc<Semaphore>,
    deregistration: Arc<Semaphore>,
    subscription: Arc<Semaphore>,
    publish: Arc<Semaphore>,
    snapshot: Arc<Semaphore>,
}

impl Capacity {
    fn new(config: &HubConfig) -> Self {
        let semaphore = |permits: usize| Arc::new(Semaphore::new(permits.max(1)));
        Self {
            registration: semaphore(config.registration_capacity),
            deregistration: semaphore(config.deregistration_capacity),
            subscription: semaphore(config.subscription_capacity),
            publish: semaphore(config.publish_capacity),
            snapshot: semaphore(config.snapshot_capacity),
        }
    }

    fn for_kind(&self, kind: MessageKind) -> &Arc<Semaphore> {
        match kind {
            MessageKind::Registration => &self.registration,
            MessageKind::Deregistration => &self.deregistration,
            MessageKind::Subscription => &self.subscription,
            MessageKind::Publish => &self.publish,
            MessageKind::Snapshot => &self.snapshot,
        }
    }
}

/// Handle to the hub coordinator.
///
/// Cheap to clone. The coordinator task stops once every handle is dropped.
#[derive(Clone)]
pub struct Hub {
    mailbox: mpsc::UnboundedSender<Envelope>,
    capacity: Arc<Capacity>,
}

impl Hub {
    /// Spawn a coordinator without an upstream relay
    pub fn new(config: &HubConfig) -> Self {
        Self::with_upstream(config, UpstreamSubscriptions::disabled())
    }

    /// Spawn a coordinator that reports newly created channels upstream
    pub fn with_upstream(config: &HubConfig, upstream: UpstreamSubscriptions) -> Self {
        let (mailbox, receiver) = mpsc::unbounded_channel();

        let coordinator = HubCoordinator {
            receiver,
            clients: HashMap::new(),
            channels: HashMap::new(),
            memberships: HashMap::new(),
            upstream,
        };
        tokio::spawn(coordinator.run());

        Self {
            mailbox,
            capacity: Arc::new(Capacity::new(config)),
        }
    }

    /// Register a client, counting it as connected
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.request(|respond_to| HubMessage::Register { client, respond_to })
            .await
    }

    /// Deregister a client and remove it from every channel.
    ///
    /// Returns false if the client was not registered.
    pub async fn deregister(&self, client_id: ClientId) -> Result<bool, HubError> {
        self.request(|respond_to| HubMessage::Deregister {
            client_id,
            respond_to,
        })
        .await
    }

    /// Subscribe a registered client to a channel; subscribing twice is a no-op
    pub async fn subscribe(
        &self,
        client_id: ClientId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        let channel = channel.into();
        self.request(|respond_to| HubMessage::Subscribe {
            client_id,
            channel,
            respond_to,
        })
        .await?
    }

    /// Queue a message for every current subscriber of a channel.
    ///
    /// Returns how many clients it was queued for.
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<usize, HubError> {
        let channel = channel.into();
        let body = body.into();
        self.request(|respond_to| HubMessage::Publish {
            channel,
            body,
            respond_to,
        })
        .await
    }

    /// Consistent snapshot of connection and subscription counts
    pub async fn stats(&self) -> Result<Stats, HubError> {
        self.request(|respond_to| HubMessage::Snapshot { respond_to })
            .await
    }

    /// Whether the coordinator task is still running
    pub fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubMessage,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        let message = build(tx);
        let permit = self.acquire(message.kind()).await?;

        self.mailbox
            .send(Envelope { message, permit })
            .map_err(|_| HubError::Closed)?;

        rx.await.map_err(|_| HubError::Closed)
    }

    /// Wait for room in the mailbox of the given kind
    async fn acquire(&self, kind: MessageKind) -> Result<OwnedSemaphorePermit, HubError> {
        self.capacity
            .for_kind(kind)
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// The coordinator task state
struct HubCoordinator {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    /// client_id -> ClientHandle
    clients: HashMap<ClientId, ClientHandle>,
    /// channel_name -> Set<client_id>; entries are kept once created
    channels: HashMap<String, HashSet<ClientId>>,
    /// client_id -> Set<channel_name>
    memberships: HashMap<ClientId, HashSet<String>>,
    upstream: UpstreamSubscriptions,
}

impl HubCoordinator {
    async fn run(mut self) {
        tracing::info!("Hub coordinator started");

        while let Some(Envelope { message, permit }) = self.receiver.recv().await {
            self.handle(message);
            drop(permit);
        }

        tracing::info!(
            connections = self.clients.len(),
            channels = self.channels.len(),
            "Hub coordinator stopped"
        );
    }

    fn handle(&mut self, message: HubMessage) {
        match message {
            HubMessage::Register { client, respond_to } => {
                self.register(client);
                let _ = respond_to.send(());
            }
            HubMessage::Deregister {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.deregister(client_id));
            }
            HubMessage::Subscribe {
                client_id,
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.subscribe(client_id, channel));
            }
            HubMessage::Publish {
                channel,
                body,
                respond_to,
            } => {
                let _ = respond_to.send(self.publish(channel, body));
            }
            HubMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn register(&mut self, client: ClientHandle) {
        let client_id = client.id();
        if self.clients.insert(client_id, client).is_some() {
            tracing::warn!(client_id = %client_id, "Client registered twice");
        }

        CLIENTS_CONNECTED.set(self.clients.len() as i64);
        tracing::info!(
            client_id = %client_id,
            connections = self.clients.len(),
            "Client registered"
        );
    }

    fn deregister(&mut self, client_id: ClientId) -> bool {
        let Some(client) = self.clients.remove(&client_id) else {
            tracing::debug!(client_id = %client_id, "Deregistration of unknown client ignored");
            return false;
        };

        for channel in self.memberships.remove(&client_id).unwrap_or_default() {
            if let Some(members) = self.channels.get_mut(&channel) {
                members.remove(&client_id);
            }
        }

        CLIENTS_CONNECTED.set(self.clients.len() as i64);
        tracing::info!(
            client_id = %client_id,
            connections = self.clients.len(),
            connected_secs = (chrono::Utc::now() - client.connected_at()).num_seconds(),
            "Client deregistered"
        );
        true
    }

    fn subscribe(&mut self, client_id: ClientId, channel: String) -> Result<(), HubError> {
        if !self.clients.contains_key(&client_id) {
            tracing::warn!(
                client_id = %client_id,
                channel = %channel,
                "Subscription for unregistered client rejected"
            );
            return Err(HubError::NotRegistered(client_id));
        }

        if !self.channels.contains_key(&channel) {
            self.upstream.request(&channel);
            CHANNELS_ACTIVE.set(self.channels.len() as i64 + 1);
            tracing::info!(channel = %channel, "Channel created");
        }

        let members = self.channels.entry(channel.clone()).or_default();
        if members.insert(client_id) {
            self.memberships
                .entry(client_id)
                .or_default()
                .insert(channel.clone());
            SUBSCRIPTIONS_TOTAL.inc();
            tracing::debug!(client_id = %client_id, channel = %channel, "Subscribed to channel");
        }

        Ok(())
    }

    fn publish(&self, channel: String, body: String) -> usize {
        let Some(members) = self.channels.get(&channel) else {
            tracing::debug!(channel = %channel, "No local subscribers for channel");
            return 0;
        };

        let mut delivered = 0;
        for client in members.iter().filter_map(|id| self.clients.get(id)) {
            let message = ChannelMessage {
                channel: channel.clone(),
                body: body.clone(),
            };
            if client.deliver(message) {
                delivered += 1;
            } else {
                MESSAGES_DROPPED_TOTAL.inc();
            }
        }

        MESSAGES_DELIVERED_TOTAL.inc_by(delivered as u64);
        tracing::debug!(
            channel = %channel,
            subscribers = members.len(),
            delivered = delivered,
            "Published channel message"
        );
        delivered
    }

    fn snapshot(&self) -> Stats {
        Stats {
            connections: self.clients.len(),
            subscription_counts: self
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
        }
    }
}
