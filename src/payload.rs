//! Payload decoding.
//!
//! Turns an envelope body into the ordered [`WorkItem`]s it carries. Two
//! wire encodings are supported, selected by [`Scheme`]:
//!
//! - [`Scheme::Structured`]: a protobuf [`EdgesMessage`] holding a list of
//!   URLs. Corrupt input is an error, never a partial list.
//! - [`Scheme::Raw`]: the body is one opaque item. Any byte sequence is
//!   accepted, including empty and non-UTF-8 bodies.
//!
//! Decoding is pure and can run concurrently for independent envelopes.

use std::{borrow::Cow, fmt};

use bytes::Bytes;
use prost::Message;
use tracing_error::SpanTrace;

/// Structured payload: the outgoing edges discovered on a crawled page.
#[derive(Clone, PartialEq, Message)]
pub struct EdgesMessage {
    #[prost(string, repeated, tag = "1")]
    pub urls: Vec<String>,
}

/// Wire encoding of envelope bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Structured,
    Raw,
}

/// One unit of work forwarded downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// A string decoded from a structured record.
    Text(String),
    /// An opaque identifier made of raw bytes.
    Raw(Bytes),
}

impl WorkItem {
    /// Bytes that identify this item on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WorkItem::Text(text) => text.as_bytes(),
            WorkItem::Raw(bytes) => bytes,
        }
    }

    /// Textual form of the item.
    ///
    /// Raw items are rendered with every byte outside `A-Za-z0-9-_.~`
    /// percent-encoded, which percent-decodes back to the original bytes.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            WorkItem::Text(text) => Cow::Borrowed(text.as_str()),
            WorkItem::Raw(bytes) => urlencoding::encode_binary(bytes),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl From<&str> for WorkItem {
    fn from(value: &str) -> Self {
        WorkItem::Text(value.to_owned())
    }
}

/// Decode an envelope body into its work items.
pub fn decode(body: &Bytes, scheme: Scheme) -> Result<Vec<WorkItem>, DecodeError> {
    match scheme {
        Scheme::Structured => {
            let message = EdgesMessage::decode(body.as_ref()).map_err(DecodeError::malformed)?;
            Ok(message.urls.into_iter().map(WorkItem::Text).collect())
        }
        Scheme::Raw => Ok(vec![WorkItem::Raw(body.clone())]),
    }
}

/// Error returned when a body is not a valid record of its scheme.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    source: prost::DecodeError,
}

impl DecodeError {
    fn malformed(source: prost::DecodeError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed payload: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
