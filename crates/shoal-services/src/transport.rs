//! Transport abstraction: ordered, bidirectional message channels to peers.
//!
//! The overlay never touches sockets. A transport hands out [`Connection`]s,
//! each a frame sink plus a stream of [`ChannelEvent`]s from the remote side.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use shoal_core::PeerId;

use crate::error::TransportError;

/// Which component a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLabel {
    /// Long-lived pooled channel carrying every protocol.
    Pool,
    /// Short-lived channel for one shuffle + probe exchange.
    Maintenance,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Data(Bytes),
    Closed,
    Error(TransportError),
}

/// Outgoing half of a channel.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;
    /// Close the channel. The remote side observes [`ChannelEvent::Closed`].
    fn close(&self);
    fn is_open(&self) -> bool;
}

pub struct Connection {
    pub peer: PeerId,
    pub label: ChannelLabel,
    pub sink: Arc<dyn FrameSink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> PeerId;

    /// Open a channel to `peer`. May never resolve; callers bound it with a timeout.
    async fn open(&self, peer: PeerId, label: ChannelLabel) -> Result<Connection, TransportError>;

    /// Next channel opened by a remote peer. `None` once the transport is gone.
    async fn accept(&self) -> Option<Connection>;
}
