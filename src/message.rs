//! Protocol messages exchanged between clients, sessions and the store.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Application payload addressed to a channel
    Data,
    /// Acknowledges the message with the same `id` on behalf of `client`
    Ack,
    /// Keep-alive from a client, never stored
    Ping,
    /// Client options, never stored
    #[serde(rename = "option")]
    Options,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [Self::Data, Self::Ack, Self::Ping, Self::Options];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Ack => "ack",
            Self::Ping => "ping",
            Self::Options => "option",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message.
///
/// Acks carry the id of the message they acknowledge in `id` and the
/// acknowledging client in `client`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Unix millis, stamped by the store on dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    /// Build a `data` message for `channel`
    pub fn data(id: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Data,
            channel: Some(channel.into()),
            sender: None,
            client: None,
            data: Some(data),
            timestamp: None,
        }
    }

    /// Build an ack of message `target` by `client`
    pub fn ack(target: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            id: target.into(),
            kind: MessageKind::Ack,
            channel: None,
            sender: None,
            client: Some(client.into()),
            data: None,
            timestamp: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Ack
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }
}

/// Generate a fresh message or client id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
