//! Wire format: label-tagged protocol envelopes.
//!
//! Every message on a channel is a JSON object carrying a protocol label
//! (`prot`), a kind (`type`) and the protocol's fields in camelCase:
//!
//! ```text
//! {"prot":"VIVALDI","type":"REQUEST","token":1718000000000}
//! ```
//!
//! Field names are part of the protocol. Renaming a field here breaks
//! interoperability with every deployed peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;
use crate::peer::{PeerDescriptor, PeerId};

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "prot")]
pub enum Message {
    #[serde(rename = "CYCLON")]
    Cyclon(CyclonMessage),
    #[serde(rename = "VIVALDI")]
    Vivaldi(VivaldiMessage),
    #[serde(rename = "CLOSEPEER")]
    ClosePeer(ClosePeerMessage),
    #[serde(rename = "NEIGHMAN")]
    Neighbor(NeighborMessage),
    #[serde(rename = "SEGMENT")]
    Segment(SegmentMessage),
}

/// Protocol label. Handlers are registered per label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    Cyclon,
    Vivaldi,
    #[serde(rename = "CLOSEPEER")]
    ClosePeer,
    #[serde(rename = "NEIGHMAN")]
    Neighbor,
    Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// Ties a response to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Correlation {
    Token(u64),
    Url(String),
}

// ── Per-protocol bodies ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CyclonMessage {
    #[serde(rename = "REQUEST", rename_all = "camelCase")]
    Request {
        shuffle_list: Vec<PeerDescriptor>,
        token: u64,
    },
    #[serde(rename = "RESPONSE", rename_all = "camelCase")]
    Response {
        shuffle_list: Vec<PeerDescriptor>,
        token: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VivaldiMessage {
    #[serde(rename = "REQUEST")]
    Request { token: u64 },
    #[serde(rename = "RESPONSE")]
    Response {
        token: u64,
        coord: Coordinate,
        uncertainty: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClosePeerMessage {
    #[serde(rename = "REQUEST")]
    Request {
        sender: PeerId,
        timestamp: u64,
        coord: Coordinate,
    },
    #[serde(rename = "RESPONSE")]
    Response {
        timestamp: u64,
        peers: Vec<PeerDescriptor>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NeighborMessage {
    #[serde(rename = "REQUEST")]
    Request {
        sender: PeerId,
        timestamp: u64,
        bitrate: u64,
        coord: Coordinate,
        upload: u64,
    },
    #[serde(rename = "RESPONSE")]
    Response {
        sender: PeerId,
        timestamp: u64,
        playing: bool,
        coord: Coordinate,
        upload: u64,
        bitrate: u64,
    },
    #[serde(rename = "NOTIFICATION", rename_all = "camelCase")]
    Notification {
        notification_type: NotificationType,
        sender: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitrate: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    /// Sender stopped playing.
    Paused,
    /// Sender switched to another video bitrate.
    BrChange,
    /// Sender dropped the receiver from its outbound list.
    RemoveFromInbound,
    /// Sender dropped the receiver from its inbound list.
    RemoveFromOutbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SegmentMessage {
    #[serde(rename = "REQUEST", rename_all = "camelCase")]
    Request {
        sender: PeerId,
        stream_type: StreamType,
        index: u64,
        rep_id: String,
        url: String,
    },
    #[serde(rename = "RESPONSE")]
    Response {
        sender: PeerId,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Bytes>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<NoDataReason>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Video,
    Audio,
}

/// Why a segment response carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoDataReason {
    NotStarted,
    InitBuffer,
    Paused,
    NoDecisionYet,
    OtherBitrate,
    NotResponsible,
    NotYetDownloaded,
}

impl NoDataReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoDataReason::NotStarted => "NOT_STARTED",
            NoDataReason::InitBuffer => "INIT_BUFFER",
            NoDataReason::Paused => "PAUSED",
            NoDataReason::NoDecisionYet => "NO_DECISION_YET",
            NoDataReason::OtherBitrate => "OTHER_BITRATE",
            NoDataReason::NotResponsible => "NOT_RESPONSIBLE",
            NoDataReason::NotYetDownloaded => "NOT_YET_DOWNLOADED",
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────────

impl Message {
    pub fn label(&self) -> Label {
        match self {
            Message::Cyclon(_) => Label::Cyclon,
            Message::Vivaldi(_) => Label::Vivaldi,
            Message::ClosePeer(_) => Label::ClosePeer,
            Message::Neighbor(_) => Label::Neighbor,
            Message::Segment(_) => Label::Segment,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Cyclon(CyclonMessage::Request { .. })
            | Message::Vivaldi(VivaldiMessage::Request { .. })
            | Message::ClosePeer(ClosePeerMessage::Request { .. })
            | Message::Neighbor(NeighborMessage::Request { .. })
            | Message::Segment(SegmentMessage::Request { .. }) => MessageKind::Request,
            Message::Neighbor(NeighborMessage::Notification { .. }) => MessageKind::Notification,
            _ => MessageKind::Response,
        }
    }

    /// Correlation key shared by a request and its response.
    /// Notifications have none.
    pub fn correlation(&self) -> Option<Correlation> {
        let key = match self {
            Message::Cyclon(CyclonMessage::Request { token, .. })
            | Message::Cyclon(CyclonMessage::Response { token, .. })
            | Message::Vivaldi(VivaldiMessage::Request { token })
            | Message::Vivaldi(VivaldiMessage::Response { token, .. }) => Correlation::Token(*token),
            Message::ClosePeer(ClosePeerMessage::Request { timestamp, .. })
            | Message::ClosePeer(ClosePeerMessage::Response { timestamp, .. })
            | Message::Neighbor(NeighborMessage::Request { timestamp, .. })
            | Message::Neighbor(NeighborMessage::Response { timestamp, .. }) => {
                Correlation::Token(*timestamp)
            }
            Message::Segment(SegmentMessage::Request { url, .. })
            | Message::Segment(SegmentMessage::Response { url, .. }) => Correlation::Url(url.clone()),
            Message::Neighbor(NeighborMessage::Notification { .. }) => return None,
        };
        Some(key)
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

static LAST_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Millisecond wall-clock timestamp, bumped so that no two calls in this
/// process return the same value.
pub fn fresh_token() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TOKEN.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(msg: &Message) -> Result<Bytes, WireError> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    Ok(serde_json::from_slice(frame)?)
}
