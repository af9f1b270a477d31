#![doc = include_str!("../README.md")]

pub mod config;
pub mod dispatcher;
pub mod embedding;
pub mod envelope;
mod feed;
pub mod payload;
pub mod queue;
pub mod transport;

#[doc(inline)]
pub use config::{Config, ConfigError};

#[doc(inline)]
pub use dispatcher::{
    DefaultDispatcherHook, DispatchOutcome, Dispatcher, DispatcherHook, Disposition,
};

#[doc(inline)]
pub use envelope::{Envelope, Settlement};

#[doc(inline)]
pub use feed::Feed;

#[doc(inline)]
pub use payload::{DecodeError, EdgesMessage, Scheme, WorkItem};

#[doc(inline)]
pub use queue::{Acknowledge, Queue, QueueError, QueueErrorKind};

#[doc(inline)]
pub use transport::{Downstream, HttpDownstream, Route, TransportError, TransportErrorKind};
