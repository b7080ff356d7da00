//! Routes inbound messages to the handler registered for their protocol label.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use shoal_core::{Label, Message, MessageKind, PeerId};

use crate::link::Link;

/// A protocol component reachable over links.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Answer a REQUEST. `None` sends nothing back.
    async fn handle_request(&self, link: &Arc<Link>, msg: Message) -> Option<Message>;

    async fn handle_notification(&self, _link: &Arc<Link>, _msg: Message) {}

    /// The pooled link to `peer` was closed or failed on the remote side.
    fn on_link_closed(&self, _peer: PeerId) {}
}

/// Label → handler table shared by every link of one kind.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<Label, Arc<dyn ProtocolHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, label: Label, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(label, handler);
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    fn handler(&self, label: Label) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(&label).map(|h| h.value().clone())
    }

    pub async fn dispatch(&self, link: &Arc<Link>, msg: Message) {
        match msg.kind() {
            MessageKind::Response => {
                link.resolve(msg);
            }
            MessageKind::Request => {
                let Some(handler) = self.handler(msg.label()) else {
                    tracing::debug!(peer = link.peer(), label = ?msg.label(), "no handler for request");
                    return;
                };
                if let Some(reply) = handler.handle_request(link, msg).await {
                    if let Err(e) = link.send(&reply) {
                        tracing::debug!(peer = link.peer(), error = %e, "reply not sent");
                    }
                }
            }
            MessageKind::Notification => {
                if let Some(handler) = self.handler(msg.label()) {
                    handler.handle_notification(link, msg).await;
                }
            }
        }
    }

    pub fn link_lost(&self, peer: PeerId) {
        let handlers: Vec<_> = self.handlers.iter().map(|h| h.value().clone()).collect();
        for handler in handlers {
            handler.on_link_closed(peer);
        }
    }
}
