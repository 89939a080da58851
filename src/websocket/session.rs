//! Per-connection protocol state machine.
//!
//! A session starts unauthenticated. An `auth` command registers the client
//! with the hub, after which `subscribe` commands are accepted. Any refused or
//! out-of-order command ends the session: the client is deregistered first,
//! then the caller closes the socket with the returned [`CloseReason`].

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::{AuthorizationGate, Metadata};
use crate::hub::{ChannelMessage, ClientHandle, ClientId, Hub};
use crate::metrics::ProtocolMetrics;

use super::message::{ClientMessage, CloseReason, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Subscribed,
    Disconnected,
}

/// Protocol state of one connection, independent of the transport
pub struct Session {
    hub: Hub,
    gate: Arc<dyn AuthorizationGate>,
    deliveries: mpsc::Sender<ChannelMessage>,
    state: ConnectionState,
    client: Option<ClientHandle>,
    registration: Option<Registration>,
}

impl Session {
    /// `deliveries` receives channel messages once the client is registered
    pub fn new(
        hub: Hub,
        gate: Arc<dyn AuthorizationGate>,
        deliveries: mpsc::Sender<ChannelMessage>,
    ) -> Self {
        Self {
            hub,
            gate,
            deliveries,
            state: ConnectionState::Unauthenticated,
            client: None,
            registration: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client.as_ref().map(ClientHandle::id)
    }

    /// Apply one client command.
    ///
    /// On error the session is already torn down and deregistered.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<ServerMessage, CloseReason> {
        ProtocolMetrics::record_command(message.kind());

        let result = match (self.state, message) {
            (ConnectionState::Unauthenticated, ClientMessage::Auth { auth }) => {
                self.authenticate(auth.unwrap_or_default()).await
            }
            (ConnectionState::Unauthenticated, _) => Err(CloseReason::AuthExpected),
            (
                ConnectionState::Authenticated | ConnectionState::Subscribed,
                ClientMessage::Subscribe { channel },
            ) => self.subscribe(channel).await,
            _ => Err(CloseReason::UnexpectedMessage),
        };

        if let Err(reason) = result {
            tracing::warn!(
                client_id = ?self.client_id(),
                code = reason.code(),
                reason = reason.reason(),
                "Closing connection"
            );
            self.close().await;
        }

        result
    }

    /// Deregister the client if needed and mark the session disconnected.
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        self.client = None;
        if let Some(registration) = self.registration.take() {
            registration.release().await;
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn authenticate(&mut self, metadata: Metadata) -> Result<ServerMessage, CloseReason> {
        if !self.gate.can_connect(&metadata) {
            return Err(CloseReason::Unauthorized);
        }

        let client = ClientHandle::new(metadata, self.deliveries.clone());
        let client_id = client.id();

        self.hub.register(client.clone()).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to register client");
            CloseReason::Internal
        })?;

        self.registration = Some(Registration::new(self.hub.clone(), client_id));
        self.client = Some(client);
        self.state = ConnectionState::Authenticated;

        tracing::info!(client_id = %client_id, "Client authenticated");
        Ok(ServerMessage::AuthOk)
    }

    async fn subscribe(&mut self, channel: String) -> Result<ServerMessage, CloseReason> {
        let Some(client) = &self.client else {
            return Err(CloseReason::UnexpectedMessage);
        };

        if !self.gate.can_subscribe(client.metadata(), &channel) {
            return Err(CloseReason::ChannelRefused);
        }

        self.hub
            .subscribe(client.id(), channel.as_str())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, channel = %channel, "Failed to subscribe client");
                CloseReason::Internal
            })?;

        self.state = ConnectionState::Subscribed;
        Ok(ServerMessage::SubscribeOk { channel })
    }
}

/// Keeps a client registered until released.
///
/// Dropping an unreleased registration (a cancelled connection task) still
/// deregisters the client from a spawned task.
struct Registration {
    hub: Hub,
    client_id: ClientId,
    released: bool,
}

impl Registration {
    fn new(hub: Hub, client_id: ClientId) -> Self {
        Self {
            hub,
            client_id,
            released: false,
        }
    }

    async fn release(mut self) {
        if let Err(e) = self.hub.deregister(self.client_id).await {
            tracing::warn!(client_id = %self.client_id, error = %e, "Failed to deregister client");
        }
        self.released = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let hub = self.hub.clone();
        let client_id = self.client_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = hub.deregister(client_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(client_id = %client_id, "No runtime available to deregister client");
            }
        }
    }
}
