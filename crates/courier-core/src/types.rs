//! Common types for the relay core.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verified identity of a connected client.
///
/// Produced only by the token verifier. Not necessarily unique per human:
/// anonymous sign-in mints a fresh identity every time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh random identity (UUIDv4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a single live channel, minted when the channel is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection as seen by the coordinator.
///
/// `Connecting` only exists inside `RelayCoordinator::open`, which registers
/// before returning. Queries therefore observe `Open` or `Closed`; the
/// variant appears in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade accepted, not yet registered
    Connecting,
    /// Registered and processing inbound frames
    Open,
    /// Unregistered; no further frames are processed
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// A message as sent by a client over its channel.
///
/// `from` is accepted so that clients echoing full messages still parse,
/// but it is never trusted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub from: Option<String>,
}

impl InboundMessage {
    pub fn new(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: content.into(),
            from: None,
        }
    }

    /// Parse a text frame.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A routed message, addressed and stamped with the sender's verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub from: Identity,
    pub to: Identity,
    pub content: String,
}

impl RelayMessage {
    /// Stamp an inbound message with the verified sender.
    ///
    /// Returns `None` when the message has no recipient; such messages are
    /// dropped before any routing or sink interaction.
    pub fn stamp(sender: &Identity, inbound: InboundMessage) -> Option<Self> {
        if inbound.to.is_empty() {
            return None;
        }
        Some(Self {
            from: sender.clone(),
            to: Identity::new(inbound.to),
            content: inbound.content,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
