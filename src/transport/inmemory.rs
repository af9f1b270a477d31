use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Semaphore;

use crate::transport::{Downstream, TransportError};

/// In-memory downstream for testing or dry runs.
///
/// Every request is recorded instead of being sent. Responses default to
/// `200 OK` and can be scripted per path. Clones share the same record.
///
/// A gated downstream holds every request until permits are released with
/// [`release`](RecordingDownstream::release), which lets tests observe the
/// pipeline while requests are in flight.
#[derive(Clone, Default)]
pub struct RecordingDownstream {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    responses: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, Duration>>,
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Semaphore>,
}

#[derive(Clone, Copy)]
enum Scripted {
    Status(StatusCode),
    Refuse,
}

/// A completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub path: String,
    /// Response status, or `None` if the request failed.
    pub status: Option<StatusCode>,
}

impl RecordingDownstream {
    /// Downstream that blocks every request until a permit is released.
    pub fn gated() -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Some(Semaphore::new(0)),
                ..Inner::default()
            }),
        }
    }

    /// Let `count` held requests proceed.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(count);
        }
    }

    /// Answer requests for `path` with `status`.
    pub fn respond(&self, path: impl Into<String>, status: StatusCode) {
        lock(&self.inner.responses).insert(path.into(), Scripted::Status(status));
    }

    /// Fail requests for `path` as if the connection was refused.
    pub fn refuse(&self, path: impl Into<String>) {
        lock(&self.inner.responses).insert(path.into(), Scripted::Refuse);
    }

    /// Delay requests for `path`.
    pub fn delay(&self, path: impl Into<String>, delay: Duration) {
        lock(&self.inner.delays).insert(path.into(), delay);
    }

    /// Paths in the order requests were issued.
    pub fn started(&self) -> Vec<String> {
        lock(&self.inner.started).clone()
    }

    /// Requests in the order they completed.
    pub fn completed(&self) -> Vec<Recorded> {
        lock(&self.inner.completed).clone()
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Downstream for RecordingDownstream {
    async fn get(&self, path: &str) -> Result<StatusCode, TransportError> {
        let inner = &self.inner;
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&inner.started).push(path.to_owned());

        if let Some(gate) = &inner.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let delay = lock(&inner.delays).get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&inner.responses).get(path).copied();
        let result = match scripted {
            Some(Scripted::Status(status)) => Ok(status),
            Some(Scripted::Refuse) => Err(TransportError::connect("connection refused")),
            None => Ok(StatusCode::OK),
        };

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&inner.completed).push(Recorded {
            path: path.to_owned(),
            status: result.as_ref().ok().copied(),
        });
        tracing::debug!(path, "Request recorded by in-memory downstream");
        result
    }
}
