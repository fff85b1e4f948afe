//! Plain-text rendering of stored rows for the command line viewers.

use chatrelay_core::{Message, Peer, TimestampMillis};
use chrono::{DateTime, Local};

const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

pub fn format_timestamp(timestamp_ms: TimestampMillis) -> String {
    match DateTime::from_timestamp_millis(timestamp_ms) {
        Some(utc) => utc.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string(),
        None => format!("@{timestamp_ms}"),
    }
}

pub fn format_location(latitude: Option<f64>, longitude: Option<f64>) -> String {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => format!("{lat:.5}, {lon:.5}"),
        (Some(lat), None) => format!("{lat:.5}, ?"),
        (None, Some(lon)) => format!("?, {lon:.5}"),
        (None, None) => "unknown".to_owned(),
    }
}

pub fn format_peer(peer: &Peer) -> String {
    format!(
        "{}  last seen {}  at {}",
        peer.name,
        format_timestamp(peer.timestamp_ms),
        format_location(peer.latitude, peer.longitude)
    )
}

pub fn format_message(message: &Message) -> String {
    format!(
        "[{}] #{} <{}> {}",
        format_timestamp(message.timestamp_ms),
        message.chatroom,
        message.sender,
        message.text
    )
}
