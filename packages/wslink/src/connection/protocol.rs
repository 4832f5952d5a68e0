//! Frame Protocol
//!
//! Defines the frames exchanged with the transport and the payloads callers
//! hand to the manager.

use serde::Serialize;
use serde_json::Value;

/// Normal closure status code
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure with the given reason
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// Frames received from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Peer started or acknowledged the closing handshake
    Close(Option<CloseInfo>),
}

impl Inbound {
    /// Normalize a data frame to text. Close frames carry no text.
    ///
    /// Binary payloads are decoded as UTF-8, replacing invalid sequences.
    pub fn into_text(self) -> Option<String> {
        match self {
            Inbound::Text(text) => Some(text),
            Inbound::Binary(bytes) => Some(match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
            Inbound::Close(_) => None,
        }
    }
}

/// Frames handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close(CloseInfo),
}

/// Something a caller wants to send: raw text or a structured value
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Build a structured payload from any serializable value
    pub fn structured<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Payload::Structured)
    }

    /// Text that goes on the wire
    pub fn into_text(self) -> serde_json::Result<String> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Structured(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Text(text) => write!(f, "{}", text),
            Payload::Structured(value) => write!(f, "{}", value),
        }
    }
}
