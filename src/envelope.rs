use bytes::Bytes;

use crate::queue::{Acknowledge, QueueError};

/// Unit of delivery handed over by a [`Queue`](crate::queue::Queue).
///
/// `Envelope` bundles the opaque message body together with the handle the
/// broker needs to settle that delivery later on.
///
/// ## Design
///
/// - `A` is the backend-specific acknowledgment handle (an AMQP acker, an
///   in-memory ledger entry, ...)
/// - The body is kept as [`Bytes`] so decoding never has to copy it
///
/// An envelope is settled by splitting it with [`Envelope::into_parts`] and
/// consuming the returned [`Settlement`] exactly once.
///
/// ## Example
///
/// ```rust
/// use feeder::Envelope;
///
/// let envelope = Envelope::new(7_u64, &b"http://a.com"[..]);
/// assert_eq!(envelope.body(), &b"http://a.com"[..]);
///
/// // or, equivalently
/// let envelope: Envelope<_> = (7_u64, &b"http://a.com"[..]).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<A> {
    handle: A,
    body: Bytes,
}

impl<A> Envelope<A> {
    pub fn new(handle: A, body: impl Into<Bytes>) -> Self {
        Self {
            handle,
            body: body.into(),
        }
    }

    /// Raw message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Acknowledgment handle of this delivery.
    pub fn handle(&self) -> &A {
        &self.handle
    }
}

impl<A, B> From<(A, B)> for Envelope<A>
where
    B: Into<Bytes>,
{
    fn from(value: (A, B)) -> Self {
        Envelope::new(value.0, value.1)
    }
}

impl<A> Envelope<A>
where
    A: Acknowledge,
{
    /// Split the envelope into its body and a [`Settlement`] guard.
    pub fn into_parts(self) -> (Bytes, Settlement<A>) {
        (
            self.body,
            Settlement {
                handle: Some(self.handle),
            },
        )
    }
}

/// Guard that settles a delivery exactly once.
///
/// [`ack`](Settlement::ack) and [`reject`](Settlement::reject) consume the
/// guard, so a delivery cannot be settled twice. A guard dropped while still
/// pending (a fault or panic in the processing scope) rejects the delivery
/// with `requeue = true` on the current tokio runtime, leaving it to the broker to redeliver. It never acknowledges.
#[must_use = "a pending settlement requeues its delivery when dropped"]
pub struct Settlement<A: Acknowledge> {
    handle: Option<A>,
}

impl<A: Acknowledge> Settlement<A> {
    /// Acknowledge the delivery.
    pub async fn ack(mut self) -> Result<(), QueueError> {
        match self.handle.take() {
            Some(handle) => handle.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally asking the broker to requeue it.
    pub async fn reject(mut self, requeue: bool) -> Result<(), QueueError> {
        match self.handle.take() {
            Some(handle) => handle.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl<A: Acknowledge> Drop for Settlement<A> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        tracing::warn!("Envelope left unsettled, requeueing");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = handle.reject(true).await {
                        tracing::error!(%error, "Failed to requeue unsettled envelope");
                    }
                });
            }
            // Without a runtime the broker requeues once the channel closes.
            Err(_) => tracing::warn!("No runtime available to requeue envelope"),
        }
    }
}
