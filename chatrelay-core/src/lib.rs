use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD_BYTES: usize = 65_507;
/// Receive buffer used when nothing else is configured.
pub const DEFAULT_RECV_BUFFER_BYTES: usize = 64 * 1024;
/// Buffer size the first generation of senders was tested against.
pub const LEGACY_RECV_BUFFER_BYTES: usize = 1024;
pub const DEFAULT_SERVER_PORT: u16 = 6666;

pub type PeerName = String;
pub type TimestampMillis = i64;

/// One chat utterance as carried in a single datagram.
///
/// Field declaration order is the wire order: `name`, `room`, `text`,
/// `timestamp`, `latitude`, `longitude`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRecord {
    #[serde(rename = "name")]
    pub sender: PeerName,
    #[serde(rename = "room")]
    pub chatroom: String,
    pub text: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: TimestampMillis,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Last known state of a chat participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub name: PeerName,
    pub timestamp_ms: TimestampMillis,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A received message. `id` is assigned by the message store on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Option<i64>,
    pub sender: PeerName,
    pub chatroom: String,
    pub text: String,
    pub timestamp_ms: TimestampMillis,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ChatRecord {
    pub fn to_peer(&self) -> Peer {
        Peer {
            name: self.sender.clone(),
            timestamp_ms: self.timestamp_ms,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: None,
            sender: self.sender.clone(),
            chatroom: self.chatroom.clone(),
            text: self.text.clone(),
            timestamp_ms: self.timestamp_ms,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("datagram payload is empty")]
    EmptyPayload,
    #[error("record carries no sender name")]
    EmptyRecord,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("encoded record is {len} bytes, limit is {max}")]
    RecordTooLarge { len: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Errors produced by senders that are known to emit junk datagrams.
    /// They are dropped without a warning.
    pub fn is_benign(&self) -> bool {
        matches!(self, CoreError::EmptyPayload | CoreError::EmptyRecord)
    }
}

// Every field is optional on the way in; producers have been seen to omit
// fields, and the missing ones are filled in by `decode_record`.
#[derive(Debug, Default, Deserialize)]
struct LenientRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

pub fn encode_record(record: &ChatRecord) -> Result<Vec<u8>, CoreError> {
    let payload =
        serde_json::to_vec(record).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if payload.len() > MAX_UDP_PAYLOAD_BYTES {
        return Err(CoreError::RecordTooLarge {
            len: payload.len(),
            max: MAX_UDP_PAYLOAD_BYTES,
        });
    }
    Ok(payload)
}

/// Decodes one datagram payload.
///
/// Fields are looked up by key, so producers that reorder them still decode.
/// `received_at_ms` stands in for a missing `timestamp`.
pub fn decode_record(
    payload: &[u8],
    received_at_ms: TimestampMillis,
) -> Result<ChatRecord, CoreError> {
    if payload.is_empty() {
        return Err(CoreError::EmptyPayload);
    }

    // Parse into a map first: a bare struct would also accept a JSON array
    // positionally, and only objects are records.
    let object: Map<String, Value> =
        serde_json::from_slice(payload).map_err(|err| CoreError::Malformed(err.to_string()))?;
    let raw: LenientRecord = serde_json::from_value(Value::Object(object))
        .map_err(|err| CoreError::Malformed(err.to_string()))?;

    let sender = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(CoreError::EmptyRecord),
    };

    Ok(ChatRecord {
        sender,
        chatroom: raw.room.unwrap_or_default(),
        text: raw.text.unwrap_or_default(),
        timestamp_ms: raw.timestamp.unwrap_or(received_at_ms),
        latitude: raw.latitude,
        longitude: raw.longitude,
    })
}
