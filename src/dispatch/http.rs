use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::backoff::{BackoffPolicy, JitterSource};
use crate::dispatch::circuit::{Admission, CircuitBreakerRegistry};
use crate::dispatch::{TransportRequest, TransportResponse, elapsed_ms, sleep_or_cancel};
use crate::error::AgentError;

pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024; // 4MB

/// Error bodies are only kept for diagnostics.
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// Issues HTTP requests against one base URL with breaker admission,
/// per-attempt timeouts and jittered exponential retry.
pub struct TransportInvoker {
    client: Client,
    base_url: String,
    circuits: Arc<CircuitBreakerRegistry>,
    backoff: BackoffPolicy,
    max_retries: u32,
    jitter: Mutex<JitterSource>,
}

impl std::fmt::Debug for TransportInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportInvoker")
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl TransportInvoker {
    pub fn new(
        base_url: impl Into<String>,
        circuits: Arc<CircuitBreakerRegistry>,
        backoff: BackoffPolicy,
        max_retries: u32,
    ) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuits,
            backoff,
            max_retries,
            jitter: Mutex::new(JitterSource::from_entropy()),
        })
    }

    pub fn from_config(
        config: &Config,
        circuits: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, AgentError> {
        Self::new(
            config.base_url.clone(),
            circuits,
            BackoffPolicy::from_config(config),
            config.max_retries,
        )
    }

    /// Fix the jitter sequence, for reproducible retry timing in tests.
    pub fn with_jitter_seed(self, seed: u64) -> Self {
        Self {
            jitter: Mutex::new(JitterSource::seeded(seed)),
            ..self
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Breaker key for a logical target on this invoker's host. Invokers for
    /// different hosts can share one registry without interfering.
    pub fn circuit_key(&self, target: &str) -> String {
        format!("{} {target}", self.base_url)
    }

    /// Send `req`, retrying transient failures up to `max_retries` times.
    ///
    /// - open circuit: `CircuitOpen` immediately, nothing sent, no delay
    /// - timeouts, connection errors, 5xx, 429: recorded as breaker failures,
    ///   backed off and retried; `MaxRetriesExceeded` once retries run out
    /// - other 4xx: returned at once without retry
    /// - cancellation during a backoff sleep: `Cancelled`
    pub async fn invoke(
        &self,
        req: &TransportRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<TransportResponse, AgentError> {
        if req.timeout.is_zero() {
            return Err(AgentError::Config(format!(
                "request to {} has no timeout",
                req.target
            )));
        }

        let key = self.circuit_key(&req.target);
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(AgentError::Cancelled(elapsed_ms(start)));
            }

            let admission = self.circuits.admit(&key)?;
            attempt += 1;

            let err = match self.send_once(req).await {
                Ok(mut response) => {
                    self.circuits.record_success(&key);
                    response.attempts = attempt;
                    tracing::debug!(
                        circuit = key,
                        attempt = attempt,
                        status = response.status,
                        elapsed_ms = elapsed_ms(start),
                        "request succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                // The target answered; the request itself was rejected.
                self.circuits.record_success(&key);
                tracing::warn!(circuit = key, attempt = attempt, "request rejected: {err}");
                return Err(err);
            }

            self.circuits.record_failure(&key);

            if attempt > self.max_retries {
                tracing::error!(circuit = key, attempts = attempt, "retries exhausted: {err}");
                return Err(AgentError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if admission == Admission::Probe {
                // Circuit is open again; the next admission reports it.
                tracing::warn!(circuit = key, "recovery probe failed: {err}");
                continue;
            }

            let delay = self.retry_delay(attempt, &err);
            tracing::warn!(
                circuit = key,
                attempt = attempt,
                max_retries = self.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "transient failure, retrying: {err}"
            );
            sleep_or_cancel(delay, cancel, start).await?;
        }
    }

    fn retry_delay(&self, attempt: u32, err: &AgentError) -> Duration {
        let computed = {
            let mut rng = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
            self.backoff.delay_for(attempt, &mut rng).jittered_delay
        };

        // Honor Retry-After on 429, within the configured cap.
        match err {
            AgentError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => computed.max(Duration::from_secs(*secs).min(self.backoff.max_delay)),
            _ => computed,
        }
    }

    async fn send_once(&self, req: &TransportRequest) -> Result<TransportResponse, AgentError> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .timeout(req.timeout);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(req, e))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(AgentError::RateLimited {
                target: req.target.clone(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_ERROR_BODY_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(AgentError::Upstream {
                target: req.target.clone(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        // Reject before buffering when the server announces an oversized body
        if let Some(len) = response.content_length()
            && len > MAX_RESPONSE_BYTES as u64
        {
            return Err(AgentError::Upstream {
                target: req.target.clone(),
                message: format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
                status: None,
            });
        }

        let bytes = response.bytes().await.map_err(|e| classify(req, e))?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(AgentError::Upstream {
                target: req.target.clone(),
                message: format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    bytes.len()
                ),
                status: None,
            });
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            body: bytes.to_vec(),
            attempts: 1,
        })
    }
}

fn classify(req: &TransportRequest, e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(u64::try_from(req.timeout.as_millis()).unwrap_or(u64::MAX))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        AgentError::Transport {
            target: req.target.clone(),
            message: e.to_string(),
        }
    } else {
        AgentError::Request(e)
    }
}
