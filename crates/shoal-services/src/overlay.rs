//! Overlay maintenance over short-lived channels.
//!
//! Every cycle takes the sampling protocol's next partner, opens a dedicated
//! maintenance channel to it, runs one shuffle and one coordinate probe, and
//! closes the channel again. Maintenance channels never enter the link pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use shoal_core::{Label, PeerId};

use crate::coordinates::VivaldiProtocol;
use crate::dispatch::Dispatcher;
use crate::error::OverlayError;
use crate::link::{self, Link};
use crate::sampling::SamplingProtocol;
use crate::transport::{ChannelLabel, Connection, Transport};

pub struct OverlayController {
    transport: Arc<dyn Transport>,
    sampling: Arc<SamplingProtocol>,
    vivaldi: Arc<VivaldiProtocol>,
    dispatcher: Arc<Dispatcher>,
    connect_timeout: Duration,
}

impl OverlayController {
    pub fn new(
        transport: Arc<dyn Transport>,
        sampling: Arc<SamplingProtocol>,
        vivaldi: Arc<VivaldiProtocol>,
        connect_timeout: Duration,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(Label::Cyclon, sampling.clone());
        dispatcher.register(Label::Vivaldi, vivaldi.clone());
        Self {
            transport,
            sampling,
            vivaldi,
            dispatcher,
            connect_timeout,
        }
    }

    /// Serve a maintenance channel opened by a remote peer. Only shuffle and
    /// probe requests are answered on it.
    pub fn serve(&self, conn: Connection) {
        let link = Link::new(conn.peer, ChannelLabel::Maintenance, conn.sink);
        tokio::spawn(link::drive(link, conn.events, self.dispatcher.clone()));
    }

    async fn open(&self, peer: PeerId) -> Result<Arc<Link>, OverlayError> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.transport.open(peer, ChannelLabel::Maintenance),
        )
        .await
        .map_err(|_| OverlayError::ConnectTimeout(peer))?
        .map_err(|e| OverlayError::ConnectError {
            peer,
            reason: e.to_string(),
        })?;
        let link = Link::new(conn.peer, ChannelLabel::Maintenance, conn.sink);
        tokio::spawn(link::drive(link.clone(), conn.events, self.dispatcher.clone()));
        Ok(link)
    }

    pub async fn next_cycle(&self) -> Result<(), OverlayError> {
        let partner = self.sampling.next_peer().await?;
        let link = match self.open(partner.id).await {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!(peer = partner.id, error = %e, "maintenance connect failed");
                self.sampling.report_dead(partner.id).await;
                return Err(e);
            }
        };

        let result = async {
            self.sampling.next_cycle(&link).await?;
            self.vivaldi.next_cycle(&link).await?;
            Ok(())
        }
        .await;
        link.close();
        result
    }

    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("overlay controller shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.next_cycle().await {
                        tracing::debug!(error = %e, "overlay cycle failed");
                    }
                }
            }
        }
    }
}
