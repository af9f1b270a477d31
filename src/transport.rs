//! Downstream client.
//!
//! Every work item becomes one `GET <base><route><encoded item>` request to
//! the crawl/index service. Only the response status is observed; the body
//! is ignored.
//!
//! ## Key components
//!
//! - [`Downstream`]: trait the dispatcher calls, one request per path
//! - [`HttpDownstream`]: pooled `reqwest` implementation
//! - [`Route`] and [`item_path`]: outbound path construction
//! - [`TransportError`]: unified error type with tracing context
//!
//! Implementations never retry: a failed request is reported once and the
//! dispatcher decides what to do with it.

mod inmemory;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing_error::SpanTrace;

use crate::{payload::WorkItem, queue::BoxError};

pub use inmemory::{Recorded, RecordingDownstream};

/// User agent sent with every outbound request.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Outbound endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `/v1/crawl/<item>`: seed a crawl.
    Crawl,
    /// `/v1/url/<item>`: register a crawled URL.
    Url,
}

impl Route {
    pub fn prefix(&self) -> &'static str {
        match self {
            Route::Crawl => "/v1/crawl/",
            Route::Url => "/v1/url/",
        }
    }
}

/// Build the outbound path for `item`.
///
/// The item bytes are percent-encoded with no safe characters, so `/`, `?`,
/// `%`, spaces and non-UTF-8 bytes all end up escaped inside one path
/// segment. Items that are exactly `.` or `..` still form dot segments, which
/// [`HttpDownstream`] refuses to send.
///
/// ```rust
/// use feeder::{WorkItem, transport::{Route, item_path}};
///
/// let path = item_path(Route::Crawl, &WorkItem::from("http://b.com/c?d=1"));
/// assert_eq!(path, "/v1/crawl/http%3A%2F%2Fb.com%2Fc%3Fd%3D1");
/// ```
pub fn item_path(route: Route, item: &WorkItem) -> String {
    let encoded = urlencoding::encode_binary(item.as_bytes());
    let mut path = String::with_capacity(route.prefix().len() + encoded.len());
    path.push_str(route.prefix());
    path.push_str(&encoded);
    path
}

/// Client for the crawl/index service.
///
/// Implementations must be safe to call concurrently: the dispatcher issues
/// several requests at once through a shared reference.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Issue `GET <base><path>` and return the response status.
    async fn get(&self, path: &str) -> Result<StatusCode, TransportError>;

    /// Full URL of `path`, used when reporting outcomes.
    fn url(&self, path: &str) -> String {
        path.to_owned()
    }
}

/// TLS certificate policy for outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Validate server certificates.
    #[default]
    Verify,
    /// Accept any certificate, for internal targets with self-signed certs.
    TrustAll,
}

/// Settings of the pooled HTTP client.
#[derive(Debug, Clone)]
pub struct DownstreamSettings {
    base_url: Url,
    tls: TlsPolicy,
    timeout: Duration,
    connect_timeout: Duration,
}

impl DownstreamSettings {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            tls: TlsPolicy::default(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Total time allowed for one request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build a pooled client honoring these settings.
    pub(crate) fn client(&self) -> Result<reqwest::Client, TransportError> {
        if self.tls == TlsPolicy::TrustAll {
            tracing::warn!("TLS certificate validation disabled for outbound requests");
        }
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .danger_accept_invalid_certs(self.tls == TlsPolicy::TrustAll)
            .build()
            .map_err(TransportError::build)
    }

    /// Base URL without its trailing slash, ready for path concatenation.
    pub(crate) fn base(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_owned()
    }
}

/// Pooled HTTP implementation of [`Downstream`].
///
/// Built once per process. Cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub struct HttpDownstream {
    client: reqwest::Client,
    base: String,
}

impl HttpDownstream {
    pub fn new(settings: &DownstreamSettings) -> Result<Self, TransportError> {
        Ok(Self {
            client: settings.client()?,
            base: settings.base(),
        })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn get(&self, path: &str) -> Result<StatusCode, TransportError> {
        let url = Url::parse(&self.url(path)).map_err(TransportError::request)?;
        // Normalization resolves dot segments, which would send the request
        // to a different route.
        if !url.path().ends_with(path) {
            return Err(TransportError::request(format!(
                "path {path:?} does not survive URL normalization"
            )));
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status();
        // An unread body keeps the connection out of the pool.
        if let Err(error) = response.bytes().await {
            tracing::debug!(%error, "Failed to drain response body");
        }
        Ok(status)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Error returned by downstream requests.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The connection could not be established (refused, DNS, TLS handshake).
    Connect(BoxError),
    /// The request did not complete in time.
    Timeout(BoxError),
    /// Any other failure while sending the request or reading the response.
    Request(BoxError),
    /// The HTTP client could not be constructed.
    Build(BoxError),
}

impl TransportError {
    pub fn connect(err: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Connect(err.into()))
    }

    pub fn timeout(err: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Timeout(err.into()))
    }

    pub fn request(err: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Request(err.into()))
    }

    fn build(err: reqwest::Error) -> Self {
        Self::new(TransportErrorKind::Build(err.into()))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Short description without the span trace, for single-line logs.
    pub fn summary(&self) -> String {
        match &self.kind {
            TransportErrorKind::Connect(err) => format!("connect error: {err}"),
            TransportErrorKind::Timeout(err) => format!("timeout: {err}"),
            TransportErrorKind::Request(err) => format!("request error: {err}"),
            TransportErrorKind::Build(err) => format!("client error: {err}"),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err)
        } else if err.is_connect() {
            Self::connect(err)
        } else {
            Self::request(err)
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Connect(err) => writeln!(f, "Connect error: {err}"),
            TransportErrorKind::Timeout(err) => writeln!(f, "Timeout: {err}"),
            TransportErrorKind::Request(err) => writeln!(f, "Request error: {err}"),
            TransportErrorKind::Build(err) => writeln!(f, "Client build error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Connect(err)
            | TransportErrorKind::Timeout(err)
            | TransportErrorKind::Request(err)
            | TransportErrorKind::Build(err) => Some(err.as_ref()),
        }
    }
}
