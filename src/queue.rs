//! Queue client abstractions and broker backends.
//!
//! This module defines the consuming side of the pipeline: a [`Queue`]
//! yields [`Envelope`]s one at a time in broker delivery order, and each
//! envelope carries an [`Acknowledge`] handle used to settle it.
//!
//! ## Key components
//!
//! - [`Queue`]: sequential, cancellable feed of envelopes
//! - [`Acknowledge`]: terminal per-delivery operations (ack / reject)
//! - [`robust::Robust`]: a queue that transparently re-establishes its
//!   broker link after a disconnect
//! - [`QueueError`]: unified error type with tracing context
//!
//! Concrete implementations are provided by [`inmemory`] and, behind the
//! `rabbitmq` feature, [`rabbitmq`].

pub mod inmemory;
pub mod robust;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemoryQueue;

/// Boxed error used at backend boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Sequential feed of envelopes from a single broker channel.
///
/// The stream returned by [`envelopes`](Queue::envelopes):
/// - Yields envelopes in delivery order, suspending until one is available
/// - Hides recoverable broker failures from the caller
/// - Ends once the cancellation token fires (or the backend is exhausted)
///
/// The stream borrows the queue mutably: the channel has a single owner.
#[async_trait::async_trait]
pub trait Queue: Send {
    /// Handle used to settle a delivered envelope.
    type Handle: Acknowledge;

    /// Stream envelopes until cancellation.
    fn envelopes(&mut self, cancel: CancellationToken) -> BoxStream<'_, Envelope<Self::Handle>>;

    /// Close the broker connection.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// Terminal operations on one delivery.
///
/// Implementations are only ever called once per delivery, through a
/// [`Settlement`](crate::envelope::Settlement).
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    /// Acknowledge the delivery.
    async fn ack(&self) -> Result<(), QueueError>;

    /// Reject the delivery, optionally asking the broker to requeue it.
    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// Error returned by queue operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    kind: QueueErrorKind,
}

/// Queue errors kind.
#[derive(Debug)]
pub enum QueueErrorKind {
    /// The broker could not be reached or the channel could not be opened.
    Connection(BoxError),
    /// The broker did not accept an ack or reject.
    Acknowledgment(BoxError),
    /// The connection could not be closed cleanly.
    Closed(BoxError),
}

impl QueueError {
    /// Create a connection-related queue error.
    pub fn connection(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::Connection(err.into()),
        }
    }

    /// Create an acknowledgment-related queue error.
    pub fn acknowledgment(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::Acknowledgment(err.into()),
        }
    }

    /// Create a close-related queue error.
    pub fn closed(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: QueueErrorKind::Closed(err.into()),
        }
    }

    pub fn kind(&self) -> &QueueErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            QueueErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
            QueueErrorKind::Acknowledgment(err) => writeln!(f, "Acknowledgment error: {err}"),
            QueueErrorKind::Closed(err) => writeln!(f, "Close error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            QueueErrorKind::Connection(err) => Some(err.as_ref()),
            QueueErrorKind::Acknowledgment(err) => Some(err.as_ref()),
            QueueErrorKind::Closed(err) => Some(err.as_ref()),
        }
    }
}
