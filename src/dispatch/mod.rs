pub mod backoff;
pub mod circuit;
pub mod http;
pub mod poller;

use std::time::{Duration, Instant};

use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// One HTTP call as the Transport Invoker sees it.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Path appended to the invoker's base URL, e.g. `/tasks/abc123`.
    pub path: String,
    /// Logical circuit-breaker target, e.g. `GET /tasks/{task_id}`. Requests
    /// that differ only by ids should share a target.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Hard per-attempt timeout. Must be non-zero.
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn get(path: impl Into<String>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            target: target.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn post(
        path: impl Into<String>,
        target: impl Into<String>,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            target: target.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Attempts spent, including the successful one.
    pub attempts: u32,
}

impl TransportResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: Option<&CancellationToken>,
    started: Instant,
) -> Result<(), AgentError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled(elapsed_ms(started))),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
