//! Wire codec for relay messages.
//!
//! One message shape, two framings:
//! ```text
//! Text frame   → JSON    {"type":"update","update":[0,1,…]}
//! Binary frame → bincode (kind: u8 variant, update: len-prefixed bytes)
//! ```
//!
//! The `update` bytes are opaque to the codec and round-trip byte-exact.
//! `awareness` messages carry a JSON-encoded [`AwarenessUpdate`] in the same
//! field. Unknown `type` values fail to decode; callers drop them.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::AwarenessUpdate;

/// Upper bound for a binary message, enforced on both encode and decode.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>()
}

/// Message kinds understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// CRDT update (incremental delta or full snapshot)
    Update,
    /// Presence side channel
    Awareness,
}

/// How a message travels on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Json,
    Binary,
}

/// Top-level relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "update")]
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Wrap a CRDT update or snapshot.
    pub fn update(update: Vec<u8>) -> Self {
        Self { kind: MessageKind::Update, payload: update }
    }

    /// Wrap a presence update.
    pub fn awareness(update: &AwarenessUpdate) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_vec(update).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(Self { kind: MessageKind::Awareness, payload })
    }

    /// Parse the presence payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, DecodeError> {
        if self.kind != MessageKind::Awareness {
            return Err(DecodeError::WrongKind(self.kind));
        }
        serde_json::from_slice(&self.payload).map_err(|e| DecodeError::Payload(e.to_string()))
    }

    pub fn encode_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn decode_json(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))
    }

    /// Fails for messages the decoder would refuse, so every binary frame
    /// that leaves this codec round-trips.
    pub fn encode_binary(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode_config())
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(TransportError::Encode(format!(
                "message of {} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode_config())
            .map_err(|e| DecodeError::Binary(e.to_string()))?;
        Ok(msg)
    }

    /// Encode into a WebSocket frame.
    pub fn to_frame(&self, format: FrameFormat) -> Result<Message, TransportError> {
        Ok(match format {
            FrameFormat::Json => Message::Text(self.encode_json()?.into()),
            FrameFormat::Binary => Message::Binary(self.encode_binary()?.into()),
        })
    }

    /// Decode a data frame. Control frames yield `Ok(None)`.
    pub fn from_frame(frame: &Message) -> Result<Option<(Self, FrameFormat)>, DecodeError> {
        match frame {
            Message::Text(text) => Ok(Some((Self::decode_json(text.as_str())?, FrameFormat::Json))),
            Message::Binary(bytes) => Ok(Some((Self::decode_binary(bytes)?, FrameFormat::Binary))),
            _ => Ok(None),
        }
    }
}

/// A malformed inbound message. The relay drops it; a binder still waiting
/// for its snapshot abandons the connection and retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON message: {0}")]
    Json(String),
    #[error("invalid binary message: {0}")]
    Binary(String),
    #[error("unexpected message kind {0:?}")]
    WrongKind(MessageKind),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Socket-level failures. Scoped to one session; never fatal to the relay
/// except [`TransportError::Bind`] at startup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
}
