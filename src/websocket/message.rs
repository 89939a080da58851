use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Metadata;
use crate::hub::ChannelMessage;

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "__type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        auth: Option<Metadata>,
    },
    #[serde(rename = "subscribe")]
    Subscribe { channel: String },
    /// Any unrecognized or malformed command
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a text frame; anything unparseable becomes `Unknown`
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Failed to parse client message");
            Self::Unknown
        })
    }

    /// Label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Subscribe { .. } => "subscribe",
            Self::Unknown => "unknown",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum ServerMessage {
    #[serde(rename = "authOk")]
    AuthOk,
    #[serde(rename = "subscribeOk")]
    SubscribeOk { channel: String },
    #[serde(rename = "message")]
    Message { channel: String, body: String },
}

impl From<ChannelMessage> for ServerMessage {
    fn from(message: ChannelMessage) -> Self {
        Self::Message {
            channel: message.channel,
            body: message.body,
        }
    }
}

/// Reasons the server terminates a connection, with their close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("close 401 Unauthorized")]
    Unauthorized,
    #[error("close 401 Auth expected")]
    AuthExpected,
    #[error("close 403 Channel refused")]
    ChannelRefused,
    #[error("close 400 Unexpected message")]
    UnexpectedMessage,
    #[error("close 1011 Internal error")]
    Internal,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Unauthorized | Self::AuthExpected => 401,
            Self::ChannelRefused => 403,
            Self::UnexpectedMessage => 400,
            Self::Internal => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::AuthExpected => "Auth expected",
            Self::ChannelRefused => "Channel refused",
            Self::UnexpectedMessage => "Unexpected message",
            Self::Internal => "Internal error",
        }
    }
}
