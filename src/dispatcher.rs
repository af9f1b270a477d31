//! Dispatch loop binding the queue to the downstream service.
//!
//! For every envelope pulled from the [`Queue`], the dispatcher:
//!
//! - Decodes the body into work items according to its [`Feed`]
//! - Rejects it without requeue if the body is malformed
//! - Issues one downstream request per item, at most `concurrency` at once
//! - Acknowledges it once every item has an outcome, whatever the statuses
//!
//! Envelopes are handled strictly one after the other. The loop runs until
//! the queue feed ends or a [`CancellationToken`] is triggered. On
//! cancellation the envelope in progress gets a grace period to finish; if
//! it does not, it is abandoned and requeued, never acknowledged.

use std::{fmt, time::Duration};

use bytes::Bytes;
use futures::StreamExt as _;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope, Feed,
    payload::{self, DecodeError, WorkItem},
    queue::{Acknowledge, Queue, QueueError},
    transport::{self, Downstream, TransportError},
};

/// Default number of concurrent downstream requests per envelope.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default time an in-flight envelope may keep running after cancellation.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Result of forwarding one work item.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The downstream answered with this status.
    Status(StatusCode),
    /// No response was obtained.
    Failed(TransportError),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Status(status) => write!(f, "{}", status.as_u16()),
            DispatchOutcome::Failed(error) => f.write_str(&error.summary()),
        }
    }
}

impl From<Result<StatusCode, TransportError>> for DispatchOutcome {
    fn from(result: Result<StatusCode, TransportError>) -> Self {
        match result {
            Ok(status) => DispatchOutcome::Status(status),
            Err(error) => DispatchOutcome::Failed(error),
        }
    }
}

/// Final state of one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// All items were attempted and the envelope was acknowledged.
    Acknowledged,
    /// All items were attempted but the broker did not take the ack.
    AckFailed,
    /// The body did not decode and the envelope was rejected.
    Rejected,
    /// Shutdown cut the dispatch short; the envelope goes back to the queue.
    Abandoned,
}

/// Queue consumer that forwards work items downstream.
///
/// Generic parameters:
/// - `Q`: Queue implementation
/// - `D`: Downstream client
/// - `HK`: Hook implementation for lifecycle events
pub struct Dispatcher<Q, D, HK = DefaultDispatcherHook> {
    queue: Q,
    downstream: D,
    feed: Feed,
    concurrency: usize,
    shutdown_grace: Duration,
    hook: HK,
}

impl<Q, D> Dispatcher<Q, D, DefaultDispatcherHook>
where
    Q: Queue,
    D: Downstream,
{
    /// Create a new dispatcher with the default hook implementation.
    pub fn new(queue: Q, downstream: D, feed: Feed) -> Self {
        Self {
            queue,
            downstream,
            feed,
            concurrency: DEFAULT_CONCURRENCY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            hook: DefaultDispatcherHook,
        }
    }
}

impl<Q, D, HK> Dispatcher<Q, D, HK>
where
    Q: Queue,
    D: Downstream,
    HK: DispatcherHook,
{
    /// Maximum number of concurrent downstream requests per envelope.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Time the envelope in progress may keep running after cancellation.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Replace the dispatcher hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatcherHook>(self, hook: HK2) -> Dispatcher<Q, D, HK2> {
        Dispatcher {
            queue: self.queue,
            downstream: self.downstream,
            feed: self.feed,
            concurrency: self.concurrency,
            shutdown_grace: self.shutdown_grace,
            hook,
        }
    }

    /// Run the dispatch loop.
    ///
    /// Returns once the feed ends or `cancel` fires and the queue connection
    /// has been closed. Per-envelope failures never end the loop; the only
    /// error reported is a failure to close the connection.
    #[tracing::instrument(skip_all, fields(feed = ?self.feed))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), QueueError> {
        let Dispatcher {
            mut queue,
            downstream,
            feed,
            concurrency,
            shutdown_grace,
            hook,
        } = self;
        let worker = Worker {
            downstream,
            feed,
            concurrency,
            shutdown_grace,
            hook,
        };

        worker.hook.on_startup();
        {
            let mut envelopes = queue.envelopes(cancel.clone());
            while let Some(envelope) = envelopes.next().await {
                if worker.process(envelope, &cancel).await == Disposition::Abandoned {
                    break;
                }
            }
        }
        worker.hook.on_shutdown();

        queue.close().await
    }
}

struct Worker<D, HK> {
    downstream: D,
    feed: Feed,
    concurrency: usize,
    shutdown_grace: Duration,
    hook: HK,
}

impl<D, HK> Worker<D, HK>
where
    D: Downstream,
    HK: DispatcherHook,
{
    async fn process<A: Acknowledge>(
        &self,
        envelope: Envelope<A>,
        cancel: &CancellationToken,
    ) -> Disposition {
        let (body, settlement) = envelope.into_parts();
        self.hook.on_envelope_received(&body);

        let items = match payload::decode(&body, self.feed.scheme()) {
            Ok(items) => items,
            Err(error) => {
                self.hook.on_decode_error(&body, &error);
                match settlement.reject(false).await {
                    Ok(()) => self.hook.on_rejected(),
                    Err(error) => self.hook.on_settle_error(&error),
                }
                return Disposition::Rejected;
            }
        };

        let dispatch = self.dispatch_all(items);
        let attempted = tokio::select! {
            biased;
            attempted = dispatch => Some(attempted),
            _ = grace_expired(cancel, self.shutdown_grace) => None,
        };

        let Some(attempted) = attempted else {
            self.hook.on_abandoned();
            // Settled before the queue closes, so the requeue is not lost in
            // the race with the connection shutdown.
            if let Err(error) = settlement.reject(true).await {
                self.hook.on_settle_error(&error);
            }
            return Disposition::Abandoned;
        };

        match settlement.ack().await {
            Ok(()) => {
                self.hook.on_acknowledged(attempted);
                Disposition::Acknowledged
            }
            Err(error) => {
                self.hook.on_settle_error(&error);
                Disposition::AckFailed
            }
        }
    }

    /// Forward every item and report each outcome. Returns the item count.
    async fn dispatch_all(&self, items: Vec<WorkItem>) -> usize {
        let route = self.feed.route();
        futures::stream::iter(items)
            .map(|item| async move {
                let path = transport::item_path(route, &item);
                let outcome = DispatchOutcome::from(self.downstream.get(&path).await);
                (item, path, outcome)
            })
            .buffer_unordered(self.concurrency)
            .fold(0, |attempted, (item, path, outcome)| async move {
                self.hook
                    .on_dispatched(&item, &self.downstream.url(&path), &outcome);
                attempted + 1
            })
            .await
    }
}

async fn grace_expired(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait DispatcherHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_envelope_received(&self, body: &Bytes);
    fn on_decode_error(&self, body: &Bytes, error: &DecodeError);
    fn on_dispatched(&self, item: &WorkItem, url: &str, outcome: &DispatchOutcome);
    fn on_acknowledged(&self, items: usize);
    fn on_rejected(&self);
    fn on_abandoned(&self);
    fn on_settle_error(&self, error: &QueueError);
}

/// Default dispatcher hook implementation.
///
/// Logs lifecycle events using `tracing`. Every outcome is logged as
/// `<status-or-error> - <url>`.
pub struct DefaultDispatcherHook;

impl DispatcherHook for DefaultDispatcherHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_envelope_received(&self, body: &Bytes) {
        tracing::debug!(len = body.len(), "Envelope received");
    }

    fn on_decode_error(&self, body: &Bytes, error: &DecodeError) {
        tracing::error!(
            ?error,
            body = %urlencoding::encode_binary(body),
            "Malformed payload, rejecting envelope",
        );
    }

    fn on_dispatched(&self, item: &WorkItem, url: &str, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Status(_) => tracing::info!(%item, "{outcome} - {url}"),
            DispatchOutcome::Failed(_) => tracing::warn!(%item, "{outcome} - {url}"),
        }
    }

    fn on_acknowledged(&self, items: usize) {
        tracing::debug!(items, "Envelope acknowledged");
    }

    fn on_rejected(&self) {
        tracing::debug!("Envelope rejected");
    }

    fn on_abandoned(&self) {
        tracing::warn!("Shutdown grace period expired, abandoning envelope");
    }

    fn on_settle_error(&self, error: &QueueError) {
        tracing::error!(?error, "Failed to settle envelope, broker will redeliver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        payload::EdgesMessage,
        queue::inmemory::{InMemoryQueue, Ledger, Settled},
        transport::{Recorded, RecordingDownstream},
    };
    use prost::Message;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Received,
        DecodeError,
        Dispatched(String, String),
        Acknowledged(usize),
        Rejected,
        Abandoned,
        SettleError,
    }

    #[derive(Clone, Default)]
    struct RecordingHook(Arc<Mutex<Vec<Event>>>);

    impl RecordingHook {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl DispatcherHook for RecordingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}

        fn on_envelope_received(&self, _body: &Bytes) {
            self.push(Event::Received);
        }

        fn on_decode_error(&self, _body: &Bytes, _error: &DecodeError) {
            self.push(Event::DecodeError);
        }

        fn on_dispatched(&self, _item: &WorkItem, url: &str, outcome: &DispatchOutcome) {
            self.push(Event::Dispatched(outcome.to_string(), url.to_owned()));
        }

        fn on_acknowledged(&self, items: usize) {
            self.push(Event::Acknowledged(items));
        }

        fn on_rejected(&self) {
            self.push(Event::Rejected);
        }

        fn on_abandoned(&self) {
            self.push(Event::Abandoned);
        }

        fn on_settle_error(&self, _error: &QueueError) {
            self.push(Event::SettleError);
        }
    }

    fn edges(urls: &[&str]) -> Vec<u8> {
        EdgesMessage {
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
        .encode_to_vec()
    }

    fn closed_queue(bodies: Vec<Vec<u8>>) -> (InMemoryQueue, Ledger) {
        let mut queue = InMemoryQueue::default();
        for body in bodies {
            queue.push(body);
        }
        queue.close_feed();
        let ledger = queue.ledger();
        (queue, ledger)
    }

    async fn wait_in_flight(downstream: &RecordingDownstream, count: usize) {
        while downstream.in_flight() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn forwards_each_url_then_acknowledges() {
        let (queue, ledger) = closed_queue(vec![edges(&["http://a.com", "http://b.com/c?d=1"])]);
        let downstream = RecordingDownstream::default();
        let hook = RecordingHook::default();

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .with_hook(hook.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let mut started = downstream.started();
        started.sort();
        assert_eq!(
            started,
            vec![
                "/v1/crawl/http%3A%2F%2Fa.com".to_owned(),
                "/v1/crawl/http%3A%2F%2Fb.com%2Fc%3Fd%3D1".to_owned(),
            ]
        );
        assert_eq!(ledger.settled(), vec![(0, Settled::Acked)]);
        assert!(ledger.is_closed());

        let events = hook.events();
        assert_eq!(events.first(), Some(&Event::Received));
        assert_eq!(events.last(), Some(&Event::Acknowledged(2)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::Dispatched(..)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_without_requeue() {
        let (queue, ledger) = closed_queue(vec![b"\xff\xfe".to_vec()]);
        let downstream = RecordingDownstream::default();
        let hook = RecordingHook::default();

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .with_hook(hook.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert!(downstream.started().is_empty());
        assert_eq!(
            ledger.settled(),
            vec![(0, Settled::Rejected { requeue: false })]
        );
        assert_eq!(
            hook.events(),
            vec![Event::Received, Event::DecodeError, Event::Rejected]
        );
    }

    #[tokio::test]
    async fn downstream_failures_do_not_block_acknowledgment() {
        let (queue, ledger) =
            closed_queue(vec![edges(&["http://down.com", "http://gone.com", "http://ok.com"])]);
        let downstream = RecordingDownstream::default();
        downstream.respond(
            "/v1/crawl/http%3A%2F%2Fdown.com",
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        downstream.refuse("/v1/crawl/http%3A%2F%2Fgone.com");
        let hook = RecordingHook::default();

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .with_hook(hook.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ledger.settled(), vec![(0, Settled::Acked)]);
        let mut completed = downstream.completed();
        completed.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            completed,
            vec![
                Recorded {
                    path: "/v1/crawl/http%3A%2F%2Fdown.com".to_owned(),
                    status: Some(StatusCode::INTERNAL_SERVER_ERROR),
                },
                Recorded {
                    path: "/v1/crawl/http%3A%2F%2Fgone.com".to_owned(),
                    status: None,
                },
                Recorded {
                    path: "/v1/crawl/http%3A%2F%2Fok.com".to_owned(),
                    status: Some(StatusCode::OK),
                },
            ]
        );
        assert!(hook.events().contains(&Event::Dispatched(
            "500".to_owned(),
            "/v1/crawl/http%3A%2F%2Fdown.com".to_owned()
        )));
    }

    #[tokio::test]
    async fn acknowledgment_waits_for_in_flight_requests() {
        let queue = InMemoryQueue::default();
        queue.push(edges(&["http://a.com", "http://b.com"]));
        let ledger = queue.ledger();
        let downstream = RecordingDownstream::gated();
        let cancel = CancellationToken::new();

        let run = tokio::spawn(
            Dispatcher::new(queue, downstream.clone(), Feed::Crawl).run(cancel.clone()),
        );

        wait_in_flight(&downstream, 2).await;
        assert!(ledger.settled().is_empty());

        downstream.release(1);
        while downstream.completed().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(ledger.settled().is_empty());

        downstream.release(1);
        ledger.wait_for(1).await;
        assert_eq!(ledger.settled(), vec![(0, Settled::Acked)]);
        assert_eq!(downstream.completed().len(), 2);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_per_envelope() {
        let urls: Vec<String> = (0..10).map(|i| format!("http://site{i}.com")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let (queue, ledger) = closed_queue(vec![edges(&refs)]);
        let downstream = RecordingDownstream::default();
        for url in &urls {
            let path = transport::item_path(transport::Route::Crawl, &WorkItem::from(url.as_str()));
            downstream.delay(path, Duration::from_millis(100));
        }

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .concurrency(3)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downstream.max_in_flight(), 3);
        assert_eq!(downstream.completed().len(), 10);
        assert_eq!(ledger.settled(), vec![(0, Settled::Acked)]);
    }

    #[tokio::test]
    async fn envelopes_are_processed_one_after_the_other() {
        let (queue, ledger) = closed_queue(vec![
            edges(&["http://first.com/1", "http://first.com/2"]),
            edges(&["http://second.com"]),
        ]);
        let downstream = RecordingDownstream::default();
        downstream.delay(
            "/v1/crawl/http%3A%2F%2Ffirst.com%2F2",
            Duration::from_millis(20),
        );

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            downstream.started().last(),
            Some(&"/v1/crawl/http%3A%2F%2Fsecond.com".to_owned())
        );
        assert_eq!(
            ledger.settled(),
            vec![(0, Settled::Acked), (1, Settled::Acked)]
        );
    }

    #[tokio::test]
    async fn raw_feed_forwards_the_body_as_one_item() {
        let (queue, ledger) = closed_queue(vec![b"\xff/x".to_vec(), Vec::new()]);
        let downstream = RecordingDownstream::default();

        Dispatcher::new(queue, downstream.clone(), Feed::Url)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            downstream.started(),
            vec!["/v1/url/%FF%2Fx".to_owned(), "/v1/url/".to_owned()]
        );
        assert_eq!(
            ledger.settled(),
            vec![(0, Settled::Acked), (1, Settled::Acked)]
        );
    }

    #[tokio::test]
    async fn envelopes_pushed_while_running_are_dispatched() {
        let mut queue = InMemoryQueue::default();
        let feeder = queue.feeder().unwrap();
        queue.close_feed();
        let ledger = queue.ledger();
        let downstream = RecordingDownstream::default();

        let run = tokio::spawn(
            Dispatcher::new(queue, downstream.clone(), Feed::Crawl).run(CancellationToken::new()),
        );
        feeder.push(edges(&["http://a.com"]));
        ledger.wait_for(1).await;
        feeder.push(edges(&["http://b.com"]));
        ledger.wait_for(2).await;
        drop(feeder);
        run.await.unwrap().unwrap();

        assert_eq!(
            downstream.started(),
            vec![
                "/v1/crawl/http%3A%2F%2Fa.com".to_owned(),
                "/v1/crawl/http%3A%2F%2Fb.com".to_owned(),
            ]
        );
        assert!(ledger.is_closed());
    }

    #[tokio::test]
    async fn failed_ack_does_not_stop_the_loop() {
        let (queue, ledger) = closed_queue(vec![edges(&["http://a.com"]), edges(&["http://b.com"])]);
        queue.fail_acks(true);
        let downstream = RecordingDownstream::default();
        let hook = RecordingHook::default();

        Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
            .with_hook(hook.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downstream.completed().len(), 2);
        assert!(ledger.settled().is_empty());
        assert_eq!(
            hook.events()
                .iter()
                .filter(|e| **e == Event::SettleError)
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_unfinished_envelope_after_grace() {
        let queue = InMemoryQueue::default();
        queue.push(edges(&["http://slow.com"]));
        let ledger = queue.ledger();
        let downstream = RecordingDownstream::gated();
        let hook = RecordingHook::default();
        let cancel = CancellationToken::new();

        let run = tokio::spawn(
            Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
                .shutdown_grace(Duration::from_secs(5))
                .with_hook(hook.clone())
                .run(cancel.clone()),
        );
        wait_in_flight(&downstream, 1).await;

        cancel.cancel();
        run.await.unwrap().unwrap();

        // Requeued before the queue was closed, not by a detached task.
        assert_eq!(
            ledger.settled(),
            vec![(0, Settled::Rejected { requeue: true })]
        );
        assert!(ledger.is_closed());
        assert_eq!(hook.events().last(), Some(&Event::Abandoned));
        assert!(!hook.events().contains(&Event::SettleError));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_envelope_finish_within_grace() {
        let queue = InMemoryQueue::default();
        queue.push(edges(&["http://slow.com"]));
        queue.push(edges(&["http://never.com"]));
        let ledger = queue.ledger();
        let downstream = RecordingDownstream::gated();
        let cancel = CancellationToken::new();

        let run = tokio::spawn(
            Dispatcher::new(queue, downstream.clone(), Feed::Crawl)
                .shutdown_grace(Duration::from_secs(5))
                .run(cancel.clone()),
        );
        wait_in_flight(&downstream, 1).await;

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        downstream.release(1);
        run.await.unwrap().unwrap();

        assert_eq!(ledger.settled(), vec![(0, Settled::Acked)]);
        assert_eq!(
            downstream.started(),
            vec!["/v1/crawl/http%3A%2F%2Fslow.com".to_owned()]
        );
    }

    #[test]
    fn outcome_renders_status_code_or_error() {
        assert_eq!(
            DispatchOutcome::Status(StatusCode::NOT_FOUND).to_string(),
            "404"
        );
        let failed = DispatchOutcome::Failed(TransportError::connect("connection refused"));
        assert_eq!(failed.to_string(), "connect error: connection refused");
    }
}
