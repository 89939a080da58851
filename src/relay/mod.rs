//! Fan-out relay between hub channels and an external pub/sub store
//!
//! - `FanoutRelay`: subscribes upstream on first local subscriber and
//!   forwards upstream messages to the hub
//! - `UpstreamStore`: store boundary, implemented by `RedisStore` and
//!   `MemoryStore`
//! - `ExponentialBackoff`: reconnection delays

mod backoff;
mod fanout;
mod redis;
mod store;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use fanout::{subscription_channel, FanoutRelay, UpstreamSubscriptions};
pub use self::redis::RedisStore;
pub use store::{MemoryStore, RelayError, UpstreamConnection, UpstreamMessage, UpstreamStore};
