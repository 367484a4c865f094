//! Shared hub types: payloads, transport frames, system messages and errors.
//!
//! Every inbound transport frame is mapped to a [`Frame`]:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ Frame        │ Hub treatment                                │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ Message      │ forwarded verbatim as a room Broadcast       │
//! │ Ping         │ answered by the transport, never broadcast   │
//! │ Pong         │ heartbeat acknowledgement, consumed          │
//! │ Close        │ ends the read pump                           │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Payloads are opaque. Text stays text and binary stays binary on fan-out,
//! nothing else about the content is interpreted.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

/// Identity of one connected participant.
pub type PeerId = Uuid;

/// Outbound queue capacity per peer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Maximum silence from a peer before it is presumed dead.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Deadline for a single transport write (including pings and close frames).
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Largest inbound message accepted from a peer, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Upper bound on queued payloads flushed together by one write.
pub const MAX_COALESCED_WRITES: usize = 64;

/// Pending commands buffered in front of a room loop.
pub const ROOM_COMMAND_CAPACITY: usize = 64;

/// Heartbeat period derived from the liveness window (90% of it).
pub fn ping_period_for(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

/// Whether a payload travels as a text or a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One opaque application message.
///
/// Cloning is cheap (reference-counted bytes), so a broadcast hands every
/// recipient its own handle to the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    kind: PayloadKind,
    data: Bytes,
}

impl Payload {
    /// Text payload. Always valid UTF-8.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            data: Bytes::from(text.into()),
        }
    }

    /// Binary payload.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            data: data.into(),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// The text content, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            PayloadKind::Text => std::str::from_utf8(&self.data).ok(),
            PayloadKind::Binary => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, reason)
    }

    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(Self::GOING_AWAY, reason)
    }
}

/// A discrete unit received from or sent to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application message, fanned out to the room.
    Message(Payload),
    /// Liveness check.
    Ping(Bytes),
    /// Probe acknowledgement.
    Pong(Bytes),
    /// Close notification, optionally with a status.
    Close(Option<CloseReason>),
}

/// Synthetic messages emitted by the hub itself.
///
/// Encoded as a JSON text payload, e.g.
/// `{"type":"system","event":"joined","pin":"4242"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemMessage {
    /// Sent only to the peer that just joined `pin`.
    Joined { pin: String },
}

#[derive(Serialize)]
struct SystemEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    message: &'a SystemMessage,
}

#[derive(Deserialize)]
struct OwnedSystemEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    message: SystemMessage,
}

impl SystemMessage {
    const KIND: &'static str = "system";

    pub fn joined(pin: impl Into<String>) -> Self {
        Self::Joined { pin: pin.into() }
    }

    /// Serialize into a text payload.
    pub fn encode(&self) -> Result<Payload, HubError> {
        let envelope = SystemEnvelope {
            kind: Self::KIND,
            message: self,
        };
        Ok(Payload::text(serde_json::to_string(&envelope)?))
    }

    /// Parse a payload produced by [`SystemMessage::encode`].
    ///
    /// Returns `None` for anything else, including ordinary peer traffic.
    pub fn decode(payload: &Payload) -> Option<Self> {
        let text = payload.as_text()?;
        let envelope: OwnedSystemEnvelope = serde_json::from_str(text).ok()?;
        (envelope.kind == Self::KIND).then_some(envelope.message)
    }
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The room stopped accepting commands (emptied or shut down).
    #[error("room closed")]
    RoomClosed,
    /// The process-wide shutdown signal has fired.
    #[error("hub is shutting down")]
    ShuttingDown,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
