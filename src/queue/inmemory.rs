use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope,
    queue::{Acknowledge, Queue, QueueError},
};

/// In-memory queue for testing or local pipelines.
///
/// Bodies pushed into the queue are delivered in order, each with a
/// monotonically increasing delivery tag starting at `0`. Every settlement is
/// recorded in a shared [`Ledger`] so tests can observe what the consumer
/// acknowledged or rejected.
///
/// The feed stays open until [`close_feed`](InMemoryQueue::close_feed) is
/// called and all clones of its [`InMemoryFeeder`] are dropped.
pub struct InMemoryQueue {
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    next_tag: u64,
    ledger: Ledger,
    fail_acks: Arc<AtomicBool>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Some(sender),
            receiver,
            next_tag: 0,
            ledger: Ledger::default(),
            fail_acks: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryQueue {
    /// Enqueue a message body.
    pub fn push(&self, body: impl Into<Bytes>) {
        match &self.sender {
            Some(sender) => {
                let _ = sender.send(body.into());
            }
            None => tracing::debug!("Feed closed, dropping pushed message"),
        }
    }

    /// Handle for pushing messages while the queue is owned by a consumer.
    pub fn feeder(&self) -> Option<InMemoryFeeder> {
        self.sender.clone().map(InMemoryFeeder)
    }

    /// Stop accepting messages from this queue handle.
    ///
    /// Already enqueued bodies are still delivered.
    pub fn close_feed(&mut self) {
        self.sender = None;
    }

    /// Make every subsequent ack or reject fail, as if the broker went away.
    pub fn fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    /// Shared record of settled deliveries.
    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }
}

/// Pushes message bodies into an [`InMemoryQueue`].
#[derive(Clone)]
pub struct InMemoryFeeder(mpsc::UnboundedSender<Bytes>);

impl InMemoryFeeder {
    pub fn push(&self, body: impl Into<Bytes>) {
        let _ = self.0.send(body.into());
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    type Handle = InMemoryHandle;

    fn envelopes(&mut self, cancel: CancellationToken) -> BoxStream<'_, Envelope<InMemoryHandle>> {
        Box::pin(async_stream::stream! {
            loop {
                let body = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    body = self.receiver.recv() => body,
                };
                let Some(body) = body else { break };

                let handle = InMemoryHandle {
                    tag: self.next_tag,
                    ledger: self.ledger.clone(),
                    fail_acks: Arc::clone(&self.fail_acks),
                };
                self.next_tag += 1;
                yield Envelope::new(handle, body);
            }
        })
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.receiver.close();
        self.ledger.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Acknowledgment handle of an in-memory delivery.
#[derive(Debug)]
pub struct InMemoryHandle {
    tag: u64,
    ledger: Ledger,
    fail_acks: Arc<AtomicBool>,
}

impl InMemoryHandle {
    /// Delivery tag of this envelope.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    fn settle(&self, settled: Settled) -> Result<(), QueueError> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(QueueError::acknowledgment("in-memory broker unavailable"));
        }
        if self.ledger.is_closed() {
            return Err(QueueError::acknowledgment("queue connection closed"));
        }
        self.ledger.record(self.tag, settled);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for InMemoryHandle {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle(Settled::Acked)
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.settle(Settled::Rejected { requeue })
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Acked,
    Rejected { requeue: bool },
}

/// Shared, ordered record of settlements.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Mutex<Vec<(u64, Settled)>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Ledger {
    fn record(&self, tag: u64, settled: Settled) {
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            entries.iter().all(|(t, _)| *t != tag),
            "delivery {tag} settled twice"
        );
        entries.push((tag, settled));
        drop(entries);
        self.inner.notify.notify_waiters();
    }

    /// Settlements in the order they happened.
    pub fn settled(&self) -> Vec<(u64, Settled)> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the queue connection was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` deliveries have been settled.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.inner.notify.notified();
            if self.settled().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_in_push_order_with_increasing_tags() {
        let mut queue = InMemoryQueue::default();
        queue.push(&b"a"[..]);
        queue.push(&b"b"[..]);
        queue.close_feed();

        let envelopes: Vec<_> = queue.envelopes(CancellationToken::new()).collect().await;

        let seen: Vec<_> = envelopes
            .iter()
            .map(|e| (e.handle().tag(), e.body().clone()))
            .collect();
        assert_eq!(
            seen,
            vec![(0, Bytes::from_static(b"a")), (1, Bytes::from_static(b"b"))]
        );
    }

    #[tokio::test]
    async fn cancelled_feed_stops_before_pending_messages() {
        let mut queue = InMemoryQueue::default();
        queue.push(&b"a"[..]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let envelopes: Vec<_> = queue.envelopes(cancel).collect().await;

        assert!(envelopes.is_empty());
    }

    #[tokio::test]
    async fn failing_acks_are_not_recorded() {
        let mut queue = InMemoryQueue::default();
        queue.push(&b"a"[..]);
        queue.close_feed();
        queue.fail_acks(true);

        let envelope = queue
            .envelopes(CancellationToken::new())
            .next()
            .await
            .unwrap();
        let err = envelope.handle().ack().await.unwrap_err();

        assert!(matches!(
            err.kind(),
            crate::queue::QueueErrorKind::Acknowledgment(_)
        ));
        assert!(queue.ledger().settled().is_empty());
    }

    #[tokio::test]
    async fn settling_after_close_fails() {
        let mut queue = InMemoryQueue::default();
        queue.push(&b"a"[..]);
        queue.close_feed();

        let envelope = queue
            .envelopes(CancellationToken::new())
            .next()
            .await
            .unwrap();
        queue.close().await.unwrap();

        assert!(envelope.handle().reject(true).await.is_err());
        assert!(queue.ledger().settled().is_empty());
    }

    #[tokio::test]
    async fn pushes_through_a_feeder_reach_the_consumer() {
        let mut queue = InMemoryQueue::default();
        let feeder = queue.feeder().unwrap();
        queue.close_feed();

        feeder.push(&b"late"[..]);
        drop(feeder);
        let envelopes: Vec<_> = queue.envelopes(CancellationToken::new()).collect().await;

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].body(), &b"late"[..]);
    }

    #[tokio::test]
    #[should_panic(expected = "settled twice")]
    #[cfg(debug_assertions)]
    async fn settling_twice_fails_loudly() {
        let mut queue = InMemoryQueue::default();
        queue.push(&b"a"[..]);
        queue.close_feed();

        let envelope = queue
            .envelopes(CancellationToken::new())
            .next()
            .await
            .unwrap();
        envelope.handle().ack().await.unwrap();
        envelope.handle().reject(false).await.unwrap();
    }
}
