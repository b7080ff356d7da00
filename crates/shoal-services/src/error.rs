//! Failure taxonomy of the overlay.
//!
//! Everything except [`FetchRejection`] is absorbed inside the component
//! that hit it: the peer is evicted, the request retried elsewhere, or the
//! work deferred to the next timer tick.

use std::fmt;

use shoal_core::PeerId;

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("channel closed")]
    Closed,
    #[error("transport shut down")]
    Shutdown,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OverlayError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(PeerId),
    #[error("connect to {peer} failed: {reason}")]
    ConnectError { peer: PeerId, reason: String },
    #[error("no response within deadline")]
    ProtocolTimeout,
    #[error("link closed")]
    LinkClosed,
    /// A request with the same label and correlation is already waiting on this link.
    #[error("request already in flight")]
    InFlight,
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("no candidate peers left")]
    Exhausted,
    #[error("codec: {0}")]
    Codec(String),
}

impl From<shoal_core::wire::WireError> for OverlayError {
    fn from(e: shoal_core::wire::WireError) -> Self {
        OverlayError::Codec(e.to_string())
    }
}

/// Why a segment must come from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerReason {
    Disabled,
    NotReady,
    Initialization,
    InitBuffer,
    LowBuffer,
    Responsible,
    NoPeers,
    Fallback,
}

impl ServerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerReason::Disabled => "DISABLED",
            ServerReason::NotReady => "NOT_READY",
            ServerReason::Initialization => "INITIALIZATION",
            ServerReason::InitBuffer => "INIT_BUFFER",
            ServerReason::LowBuffer => "LOW_BUFFER",
            ServerReason::Responsible => "RESPONSIBLE",
            ServerReason::NoPeers => "NO_PEERS",
            ServerReason::Fallback => "FALLBACK",
        }
    }
}

impl fmt::Display for ServerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's only outward failure: fetch this segment from the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fetch from server ({reason})")]
pub struct FetchRejection {
    pub reason: ServerReason,
}

impl FetchRejection {
    pub fn new(reason: ServerReason) -> Self {
        Self { reason }
    }
}
