use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::hub::{Hub, HubError};
use crate::metrics::{RELAY_RECONNECTS_TOTAL, UPSTREAM_MESSAGES_TOTAL};

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::store::{RelayError, UpstreamConnection, UpstreamStore};

/// Sending side used by the hub to ask for upstream subscriptions.
///
/// Requests never block; when no relay is listening they are dropped.
#[derive(Debug, Clone)]
pub struct UpstreamSubscriptions {
    sender: Option<mpsc::UnboundedSender<String>>,
}

impl UpstreamSubscriptions {
    /// No relay attached
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub(crate) fn request(&self, channel: &str) {
        let Some(sender) = &self.sender else {
            return;
        };

        if sender.send(channel.to_string()).is_err() {
            tracing::debug!(channel = %channel, "Relay not running, upstream subscription skipped");
        }
    }
}

/// Create the request queue between the hub and a [`FanoutRelay`]
pub fn subscription_channel() -> (UpstreamSubscriptions, mpsc::UnboundedReceiver<String>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        UpstreamSubscriptions {
            sender: Some(sender),
        },
        receiver,
    )
}

/// Bridges hub channels to an upstream store.
///
/// Subscribes upstream to every channel the hub reports, and hands each
/// upstream message to the hub for delivery to local subscribers.
pub struct FanoutRelay {
    store: Arc<dyn UpstreamStore>,
    hub: Hub,
    requests: mpsc::UnboundedReceiver<String>,
    /// Every channel requested so far, resubscribed after reconnects
    channels: BTreeSet<String>,
    backoff: ExponentialBackoff,
}

impl FanoutRelay {
    pub fn new(
        store: Arc<dyn UpstreamStore>,
        hub: Hub,
        requests: mpsc::UnboundedReceiver<String>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            hub,
            requests,
            channels: BTreeSet::new(),
            backoff: ExponentialBackoff::new(backoff),
        }
    }

    /// Run until shutdown is signalled or the hub stops
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(store = self.store.name(), "Starting fan-out relay");

        loop {
            match self.store.connect().await {
                Ok(connection) => {
                    self.backoff.reset();
                    match self.serve(connection, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, store = self.store.name(), "Upstream connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        store = self.store.name(),
                        attempt = self.backoff.attempt(),
                        "Failed to connect to upstream store"
                    );
                }
            }

            let delay = self.backoff.next_delay();
            RELAY_RECONNECTS_TOTAL.inc();
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting to upstream store");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Fan-out relay stopped");
    }

    /// Returns Ok on a clean stop, Err when the connection must be replaced
    async fn serve(
        &mut self,
        mut connection: Box<dyn UpstreamConnection>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        while let Ok(channel) = self.requests.try_recv() {
            self.channels.insert(channel);
        }
        for channel in &self.channels {
            connection.subscribe(channel).await?;
        }

        tracing::info!(channels = self.channels.len(), "Upstream subscription established");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Relay received shutdown signal");
                    return Ok(());
                }
                request = self.requests.recv() => {
                    let Some(channel) = request else {
                        tracing::info!("Hub stopped, relay exiting");
                        return Ok(());
                    };
                    if self.channels.insert(channel.clone()) {
                        connection.subscribe(&channel).await?;
                        tracing::debug!(channel = %channel, "Subscribed upstream");
                    }
                }
                message = connection.next_message() => {
                    let message = message?;
                    UPSTREAM_MESSAGES_TOTAL.inc();

                    match self.hub.publish(message.channel.as_str(), message.payload).await {
                        Ok(delivered) => {
                            tracing::debug!(
                                channel = %message.channel,
                                delivered = delivered,
                                "Relayed upstream message"
                            );
                        }
                        Err(HubError::Closed) => {
                            tracing::info!("Hub stopped, relay exiting");
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, channel = %message.channel, "Failed to relay message");
                        }
                    }
                }
            }
        }
    }
}
