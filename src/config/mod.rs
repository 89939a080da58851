mod settings;

pub use settings::{
    AuthConfig, HubConfig, RedisConfig, ServerConfig, Settings, WebSocketConfig,
};
