//! Wire-level types shared between the codec, the connection and the client
//!
//! Two mutually incompatible sub-protocols exist on the relay side:
//!
//! - [`SubProtocol::Invocation`]: hub-style invocation records
//!   `{type, target, arguments}` terminated by [`RECORD_SEPARATOR`], preceded
//!   by a `{protocol, version}` handshake.
//! - [`SubProtocol::Tagged`]: one `{type, clientId, message?}` record per
//!   transport message, audio as raw binary messages.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reserved byte terminating text records
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Invocation record type discriminators
pub mod invocation_type {
    pub const INVOCATION: u8 = 1;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// Hub method names used by the invocation sub-protocol
pub mod targets {
    pub const SEND_MESSAGE: &str = "SendMessage";
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    pub const SEND_AUDIO: &str = "SendAudio";
    pub const RECEIVE_AUDIO: &str = "ReceiveAudio";
}

/// Opaque participant identifier.
///
/// Generated locally on startup and reported by peers on their messages.
/// Carries no authentication guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which wire format the relay speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubProtocol {
    /// Hub invocation records with handshake
    #[default]
    Invocation,
    /// Simple tagged JSON records
    Tagged,
}

impl SubProtocol {
    /// Whether a handshake record must precede application traffic
    pub fn requires_handshake(self) -> bool {
        matches!(self, SubProtocol::Invocation)
    }
}

/// One discrete unit exchanged over the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Handshake answer; an empty object means accepted
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Inbound invocation record, loosely typed until classified
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInvocation {
    #[serde(rename = "type")]
    pub kind: Option<u8>,
    pub target: Option<String>,
    pub arguments: Option<Vec<serde_json::Value>>,
    pub error: Option<String>,
}

/// Tagged record as it appears on the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Tagged record discriminators
pub mod tagged_type {
    pub const HELLO: &str = "hello";
    pub const MESSAGE: &str = "message";
    pub const DISCONNECT: &str = "disconnect";
    pub const PING: &str = "ping";
}

/// Membership change reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterChange {
    Joined,
    Left,
}
