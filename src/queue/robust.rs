//! Reconnecting queue.
//!
//! [`Robust`] owns one live broker [`Link`] at a time. When the link reports
//! an error or simply ends, it is closed and a new one is opened through
//! the [`Connect`] implementation, retrying at a fixed interval until it
//! succeeds or the consumer is cancelled. Callers only ever see envelopes:
//! a broker disconnect never surfaces as a per-message error.
//!
//! Deliveries that were in flight on a lost link are not acknowledged there;
//! the broker redelivers them on the new link.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope,
    queue::{Acknowledge, Queue, QueueError},
};

/// Opens broker links.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Acknowledgment handle of the deliveries produced by the link.
    type Handle: Acknowledge;
    /// Live consumer on a broker channel.
    type Link: Link<Handle = Self::Handle>;

    /// Open a connection, a channel and a consumer on it.
    async fn connect(&self) -> Result<Self::Link, QueueError>;
}

/// A live consumer on one broker connection.
#[async_trait]
pub trait Link: Send {
    type Handle: Acknowledge;

    /// Wait for the next delivery.
    ///
    /// `None` or an error means the link is gone and must be replaced.
    async fn next(&mut self) -> Option<Result<Envelope<Self::Handle>, QueueError>>;

    /// Close the link.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// Queue that transparently re-establishes its broker link.
pub struct Robust<C: Connect> {
    connector: C,
    link: Option<C::Link>,
    reconnect_interval: Duration,
}

impl<C: Connect> Robust<C> {
    /// Open the initial link.
    ///
    /// Unlike later reconnections, failing here is reported to the caller.
    #[tracing::instrument(skip_all)]
    pub async fn connect(connector: C, reconnect_interval: Duration) -> Result<Self, QueueError> {
        let link = connector.connect().await?;
        tracing::info!("Broker link established");
        Ok(Self {
            connector,
            link: Some(link),
            reconnect_interval,
        })
    }

    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }
}

#[async_trait]
impl<C> Queue for Robust<C>
where
    C: Connect,
{
    type Handle = C::Handle;

    fn envelopes(&mut self, cancel: CancellationToken) -> BoxStream<'_, Envelope<C::Handle>> {
        Box::pin(async_stream::stream! {
            loop {
                if self.link.is_none() {
                    match reestablish(&self.connector, self.reconnect_interval, &cancel).await {
                        Some(link) => self.link = Some(link),
                        None => break,
                    }
                }
                let Some(link) = self.link.as_mut() else { continue };

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = link.next() => next,
                };

                match next {
                    Some(Ok(envelope)) => yield envelope,
                    Some(Err(error)) => {
                        tracing::warn!(%error, "Broker link lost, reconnecting");
                        discard(self.link.take()).await;
                    }
                    None => {
                        tracing::warn!("Broker link closed, reconnecting");
                        discard(self.link.take()).await;
                    }
                }
            }
        })
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        match self.link.take() {
            Some(mut link) => link.close().await,
            None => Ok(()),
        }
    }
}

/// Close a link that is being replaced. It is usually already dead, so
/// failures are expected.
async fn discard<L: Link>(link: Option<L>) {
    if let Some(mut link) = link {
        if let Err(error) = link.close().await {
            tracing::debug!(%error, "Closing the replaced link failed");
        }
    }
}

/// Open a new link every `interval` until one succeeds.
///
/// Returns `None` if cancelled first.
async fn reestablish<C: Connect>(
    connector: &C,
    interval: Duration,
    cancel: &CancellationToken,
) -> Option<C::Link> {
    let mut attempt: u32 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = connector.connect() => result,
        };
        match result {
            Ok(link) => {
                tracing::info!(attempt, "Broker link re-established");
                return Some(link);
            }
            Err(error) => tracing::warn!(attempt, %error, "Reconnect attempt failed"),
        }
    }
}
