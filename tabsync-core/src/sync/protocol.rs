//! Wire protocol.
//!
//! Every payload is `<client id>\n<JSON packet>`, where the packet is
//! `[request id | null, message kind, body]`. Outbound payloads name the
//! recipient (empty for a broadcast); the relay rewrites the prefix to the
//! sender's id before forwarding.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Client id of the relay's embedded server replica.
pub const SERVER_CLIENT_ID: &str = "S";

pub const MESSAGE_SEPARATOR: char = '\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Response,
    RequestContentHashes,
    AnnounceContentHashes,
    PushChanges,
    RequestTableDiff,
    RequestRowDiff,
    RequestCellDiff,
    RequestValueDiff,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Response => 0,
            MessageKind::RequestContentHashes => 1,
            MessageKind::AnnounceContentHashes => 2,
            MessageKind::PushChanges => 3,
            MessageKind::RequestTableDiff => 4,
            MessageKind::RequestRowDiff => 5,
            MessageKind::RequestCellDiff => 6,
            MessageKind::RequestValueDiff => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageKind::Response,
            1 => MessageKind::RequestContentHashes,
            2 => MessageKind::AnnounceContentHashes,
            3 => MessageKind::PushChanges,
            4 => MessageKind::RequestTableDiff,
            5 => MessageKind::RequestRowDiff,
            6 => MessageKind::RequestCellDiff,
            7 => MessageKind::RequestValueDiff,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        MessageKind::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown message kind {code}")))
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The peer that sent the message.
    pub client_id: String,
    pub request_id: Option<String>,
    pub kind: MessageKind,
    pub body: Value,
}

/// Builds an outbound payload. `to` of `None` broadcasts.
pub fn create_payload<B: Serialize>(
    to: Option<&str>,
    request_id: Option<&str>,
    kind: MessageKind,
    body: &B,
) -> Result<String, serde_json::Error> {
    let packet = serde_json::to_string(&(request_id, kind, body))?;
    Ok(create_raw_payload(to.unwrap_or(""), &packet))
}

pub fn create_raw_payload(client_id: &str, remainder: &str) -> String {
    format!("{client_id}{MESSAGE_SEPARATOR}{remainder}")
}

/// Splits a payload into its client id and the undecoded packet.
pub fn split_payload(payload: &str) -> Option<(&str, &str)> {
    payload.split_once(MESSAGE_SEPARATOR)
}

/// Decodes an inbound payload.
pub fn receive_payload(payload: &str) -> Result<Envelope, serde_json::Error> {
    let (client_id, remainder) = split_payload(payload)
        .ok_or_else(|| de::Error::custom("payload has no client id separator"))?;
    let (request_id, kind, body): (Option<String>, MessageKind, Value) = serde_json::from_str(remainder)?;
    Ok(Envelope {
        client_id: client_id.to_string(),
        request_id,
        kind,
        body,
    })
}
