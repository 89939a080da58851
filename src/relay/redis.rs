//! Redis Pub/Sub upstream store

use async_trait::async_trait;
use futures::StreamExt;

use super::store::{RelayError, UpstreamConnection, UpstreamMessage, UpstreamStore};

/// Upstream store using Redis SUBSCRIBE channels named after hub channels
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, RelayError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl UpstreamStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamConnection>, RelayError> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(Box::new(RedisConnection { pubsub }))
    }
}

struct RedisConnection {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl UpstreamConnection for RedisConnection {
    async fn subscribe(&mut self, channel: &str) -> Result<(), RelayError> {
        self.pubsub.subscribe(channel).await?;
        tracing::debug!(channel = %channel, "Subscribed to Redis channel");
        Ok(())
    }

    async fn next_message(&mut self) -> Result<UpstreamMessage, RelayError> {
        let msg = self
            .pubsub
            .on_message()
            .next()
            .await
            .ok_or(RelayError::StreamEnded)?;

        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload()?;

        Ok(UpstreamMessage { channel, payload })
    }
}
