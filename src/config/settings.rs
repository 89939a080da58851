use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Mailbox capacities of the hub coordinator, one per message kind.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_registration_capacity")]
    pub registration_capacity: usize,
    #[serde(default = "default_registration_capacity")]
    pub deregistration_capacity: usize,
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
    #[serde(default = "default_subscription_capacity")]
    pub publish_capacity: usize,
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Seconds a new connection may stay unauthenticated
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
    /// Outbound queue size per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Upstream fan-out is disabled when unset
    pub url: Option<String>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared token expected in the `token` field of the auth metadata
    pub token: Option<String>,
    /// Channel name prefixes clients may subscribe to (empty allows all)
    #[serde(default)]
    pub channel_prefixes: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_registration_capacity() -> usize {
    10
}

fn default_subscription_capacity() -> usize {
    100
}

fn default_snapshot_capacity() -> usize {
    16
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_send_buffer() -> usize {
    32
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("hub.registration_capacity", 10)?
            .set_default("hub.deregistration_capacity", 10)?
            .set_default("hub.subscription_capacity", 100)?
            .set_default("hub.publish_capacity", 100)?
            .set_default("hub.snapshot_capacity", 16)?
            .set_default("websocket.auth_timeout", 10)?
            .set_default("websocket.send_buffer", 32)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER__PORT, REDIS__URL, HUB__SUBSCRIPTION_CAPACITY, AUTH__CHANNEL_PREFIXES, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("auth.channel_prefixes"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registration_capacity: default_registration_capacity(),
            deregistration_capacity: default_registration_capacity(),
            subscription_capacity: default_subscription_capacity(),
            publish_capacity: default_subscription_capacity(),
            snapshot_capacity: default_snapshot_capacity(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            auth_timeout: default_auth_timeout(),
            send_buffer: default_send_buffer(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8081);
        assert_eq!(settings.server_addr(), "0.0.0.0:8081");
        assert!(settings.redis.url.is_none());
        assert!(settings.auth.token.is_none());
    }

    #[test]
    fn test_hub_capacities() {
        let hub = HubConfig::default();
        assert_eq!(hub.registration_capacity, 10);
        assert_eq!(hub.deregistration_capacity, 10);
        assert_eq!(hub.subscription_capacity, 100);
        assert!(hub.snapshot_capacity > 0);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"redis": {"url": "redis://cache:6379"}}"#)
            .unwrap();
        assert_eq!(settings.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.redis.max_backoff_ms, 30_000);
        assert_eq!(settings.websocket.auth_timeout, 10);
    }
}
