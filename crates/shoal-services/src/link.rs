//! A channel to one peer with request/response correlation.
//!
//! Requests register a waiter keyed by (label, correlation) before they are
//! sent. The reader task hands each RESPONSE to its waiter; a response whose
//! waiter already gave up is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};

use shoal_core::wire::{self, Correlation};
use shoal_core::{Label, Message, PeerId};

use crate::dispatch::Dispatcher;
use crate::error::OverlayError;
use crate::transport::{ChannelEvent, ChannelLabel, FrameSink};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = oneshot::Sender<Message>;

pub struct Link {
    id: u64,
    peer: PeerId,
    label: ChannelLabel,
    sink: Arc<dyn FrameSink>,
    pending: DashMap<(Label, Correlation), Waiter>,
    closed: watch::Sender<bool>,
}

/// Which side ended a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    Local,
    Remote,
}

impl Link {
    pub fn new(peer: PeerId, label: ChannelLabel, sink: Arc<dyn FrameSink>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            label,
            sink,
            pending: DashMap::new(),
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn label(&self) -> ChannelLabel {
        self.label
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.sink.is_open()
    }

    pub fn send(&self, msg: &Message) -> Result<(), OverlayError> {
        let frame = wire::encode(msg)?;
        self.sink.send(frame).map_err(|_| OverlayError::LinkClosed)
    }

    /// Send `msg` and wait for the matching response.
    ///
    /// At most one request per (label, correlation) waits on a link at a
    /// time; a second one fails with [`OverlayError::InFlight`].
    ///
    /// On timeout the waiter is removed, so a late response is discarded
    /// by the reader instead of resolving a stale round trip.
    pub async fn request(&self, msg: Message, deadline: Duration) -> Result<Message, OverlayError> {
        let key = msg
            .correlation()
            .map(|c| (msg.label(), c))
            .ok_or_else(|| OverlayError::Codec("request without correlation".into()))?;
        if !self.is_open() {
            return Err(OverlayError::LinkClosed);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(OverlayError::InFlight),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        if let Err(e) = self.send(&msg) {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(OverlayError::LinkClosed),
            Err(_) => {
                self.pending.remove(&key);
                Err(OverlayError::ProtocolTimeout)
            }
        }
    }

    /// Hand a response to its waiter. Returns false if nobody was waiting.
    pub(crate) fn resolve(&self, msg: Message) -> bool {
        let Some(key) = msg.correlation().map(|c| (msg.label(), c)) else {
            return false;
        };
        match self.pending.remove(&key) {
            Some((_, waiter)) => waiter.send(msg).is_ok(),
            None => {
                tracing::trace!(peer = self.peer, label = ?key.0, "late response dropped");
                false
            }
        }
    }

    /// Close locally. Link-lost callbacks do not fire for local closes.
    pub fn close(&self) {
        self.closed.send_replace(true);
        self.sink.close();
        self.pending.clear();
    }
}

async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// Read events until the link ends, dispatching every decoded message.
pub async fn drive(
    link: Arc<Link>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    dispatcher: Arc<Dispatcher>,
) -> LinkEnd {
    let closed = closed_signal(link.closed.subscribe());
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = &mut closed => return LinkEnd::Local,
            event = events.recv() => match event {
                Some(ChannelEvent::Data(frame)) => match wire::decode(&frame) {
                    Ok(msg) => dispatcher.dispatch(&link, msg).await,
                    Err(e) => {
                        tracing::warn!(peer = link.peer, error = %e, "dropping malformed frame");
                    }
                },
                Some(ChannelEvent::Error(e)) => {
                    tracing::debug!(peer = link.peer, error = %e, "link error");
                    link.close();
                    return LinkEnd::Remote;
                }
                Some(ChannelEvent::Closed) | None => {
                    link.close();
                    return LinkEnd::Remote;
                }
            }
        }
    }
}
