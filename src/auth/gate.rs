//! Connection and subscription authorization hooks

use std::collections::HashMap;
use std::fmt;

use ring::hmac;

use crate::config::AuthConfig;

/// Key/value data a client supplies with its authenticate command
pub type Metadata = HashMap<String, String>;

type ConnectPredicate = dyn Fn(&Metadata) -> bool + Send + Sync;
type SubscribePredicate = dyn Fn(&Metadata, &str) -> bool + Send + Sync;

/// Decides whether a client may connect and which channels it may join.
///
/// Both hooks default to allowing everything, so an implementation only
/// overrides the checks it cares about.
pub trait AuthorizationGate: Send + Sync {
    fn can_connect(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn can_subscribe(&self, _metadata: &Metadata, _channel: &str) -> bool {
        true
    }
}

/// Gate that accepts every connection and subscription
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationGate for AllowAll {}

/// Gate built from optional closures; an unset predicate allows
#[derive(Default)]
pub struct PredicateGate {
    can_connect: Option<Box<ConnectPredicate>>,
    can_subscribe: Option<Box<SubscribePredicate>>,
}

impl PredicateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_can_connect<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Metadata) -> bool + Send + Sync + 'static,
    {
        self.can_connect = Some(Box::new(predicate));
        self
    }

    pub fn with_can_subscribe<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Metadata, &str) -> bool + Send + Sync + 'static,
    {
        self.can_subscribe = Some(Box::new(predicate));
        self
    }
}

impl AuthorizationGate for PredicateGate {
    fn can_connect(&self, metadata: &Metadata) -> bool {
        self.can_connect
            .as_ref()
            .map_or(true, |predicate| predicate(metadata))
    }

    fn can_subscribe(&self, metadata: &Metadata, channel: &str) -> bool {
        self.can_subscribe
            .as_ref()
            .map_or(true, |predicate| predicate(metadata, channel))
    }
}

impl fmt::Debug for PredicateGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateGate")
            .field("can_connect", &self.can_connect.is_some())
            .field("can_subscribe", &self.can_subscribe.is_some())
            .finish()
    }
}

/// Gate driven by the `auth` configuration section.
///
/// With no token configured every client may connect (development mode),
/// and an empty prefix list allows every channel.
#[derive(Debug, Clone)]
pub struct ConfigGate {
    token: Option<TokenCheck>,
    channel_prefixes: Vec<String>,
}

/// The configured token, held as an HMAC tag under a per-process key so
/// candidates are compared in constant time
#[derive(Debug, Clone)]
struct TokenCheck {
    key: hmac::Key,
    expected: hmac::Tag,
}

impl TokenCheck {
    fn new(token: &str) -> Self {
        let secret: [u8; 32] = rand::random();
        let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        let expected = hmac::sign(&key, token.as_bytes());
        Self { key, expected }
    }

    fn matches(&self, candidate: &str) -> bool {
        hmac::verify(&self.key, candidate.as_bytes(), self.expected.as_ref()).is_ok()
    }
}

impl ConfigGate {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            token: config.token.as_deref().map(TokenCheck::new),
            channel_prefixes: config.channel_prefixes.clone(),
        }
    }
}

impl AuthorizationGate for ConfigGate {
    fn can_connect(&self, metadata: &Metadata) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };

        match metadata.get("token") {
            Some(token) if expected.matches(token) => true,
            Some(_) => {
                tracing::warn!("Invalid auth token provided");
                false
            }
            None => {
                tracing::warn!("Missing auth token");
                false
            }
        }
    }

    fn can_subscribe(&self, _metadata: &Metadata, channel: &str) -> bool {
        self.channel_prefixes.is_empty()
            || self
                .channel_prefixes
                .iter()
                .any(|prefix| channel.starts_with(prefix.as_str()))
    }
}
