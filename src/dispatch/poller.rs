use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::backoff::{BackoffPolicy, JitterSource};
use crate::dispatch::http::TransportInvoker;
use crate::dispatch::{TransportRequest, elapsed_ms, sleep_or_cancel};
use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work submitted to the code-generation service.
///
/// Only the poller moves a task between states, and a terminal task never
/// changes again. `result` is set only when completed, `error` only when
/// failed or timed out.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    id: String,
    prompt: String,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    submitted_at: Instant,
    polls: u32,
}

impl Task {
    pub(crate) fn submitted(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            submitted_at: Instant::now(),
            polls: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Status checks issued for this task so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn observe_progress(&mut self, status: TaskStatus) -> bool {
        if self.is_terminal() || status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub(crate) fn complete(&mut self, result: String) -> bool {
        self.finish(TaskStatus::Completed, Some(result), None)
    }

    pub(crate) fn fail(&mut self, error: String) -> bool {
        self.finish(TaskStatus::Failed, None, Some(error))
    }

    pub(crate) fn time_out(&mut self, error: String) -> bool {
        self.finish(TaskStatus::TimedOut, None, Some(error))
    }

    pub(crate) fn cancel(&mut self) -> bool {
        self.finish(TaskStatus::Cancelled, None, None)
    }

    fn finish(&mut self, status: TaskStatus, result: Option<String>, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        true
    }
}

/// Remote status as reported by one status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Still pending or running.
    InProgress(TaskStatus),
    /// Completed with the raw result payload.
    Completed(String),
    /// Explicit remote failure with its message.
    Failed(String),
}

/// Service-specific request building and response parsing for task APIs.
pub trait TaskApi: Send + Sync {
    fn build_submit_request(&self, prompt: &str, timeout: Duration) -> TransportRequest;

    fn build_status_request(&self, task_id: &str, timeout: Duration) -> TransportRequest;

    /// Extract the task id from a submission response.
    fn parse_submit_response(&self, body: &[u8]) -> Result<String, AgentError>;

    /// Anything that cannot be read as a known status is a `SchemaParse` error.
    fn parse_status_response(&self, body: &[u8]) -> Result<PollStatus, AgentError>;
}

// ---------------------------------------------------------------------------
// Codegen task API
// ---------------------------------------------------------------------------

/// `POST {submit_path}` with `{prompt, org_id}`, then `GET {status_path}`.
/// Paths may contain `{org_id}`; the status path must contain `{task_id}`.
pub struct CodegenTaskApi {
    api_key: String,
    org_id: String,
    submit_path: String,
    status_path: String,
}

impl std::fmt::Debug for CodegenTaskApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodegenTaskApi")
            .field("org_id", &self.org_id)
            .field("submit_path", &self.submit_path)
            .field("status_path", &self.status_path)
            .finish_non_exhaustive()
    }
}

impl CodegenTaskApi {
    pub fn new(
        api_key: impl Into<String>,
        org_id: impl Into<String>,
        submit_path: impl Into<String>,
        status_path: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            org_id: org_id.into(),
            submit_path: submit_path.into(),
            status_path: status_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.api_key.clone(),
            config.org_id.clone(),
            config.submit_path.clone(),
            config.status_path.clone(),
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

impl TaskApi for CodegenTaskApi {
    fn build_submit_request(&self, prompt: &str, timeout: Duration) -> TransportRequest {
        let path = self.submit_path.replace("{org_id}", &self.org_id);
        let body = serde_json::json!({
            "prompt": prompt,
            "org_id": self.org_id,
        });
        TransportRequest::post(path, format!("POST {}", self.submit_path), body, timeout)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
    }

    fn build_status_request(&self, task_id: &str, timeout: Duration) -> TransportRequest {
        let path = self
            .status_path
            .replace("{org_id}", &self.org_id)
            .replace("{task_id}", task_id);
        TransportRequest::get(path, format!("GET {}", self.status_path), timeout)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
    }

    fn parse_submit_response(&self, body: &[u8]) -> Result<String, AgentError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AgentError::SchemaParse(format!("submission response: {e}")))?;

        let id = match v.get("task_id").or_else(|| v.get("id")) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(AgentError::SchemaParse(
                    "submission response missing 'task_id'".into(),
                ));
            }
        };

        // The id is interpolated into the status path.
        let usable = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !usable {
            return Err(AgentError::SchemaParse(format!(
                "submission response has unusable task id {id:?}"
            )));
        }
        Ok(id)
    }

    fn parse_status_response(&self, body: &[u8]) -> Result<PollStatus, AgentError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AgentError::SchemaParse(format!("status response: {e}")))?;

        let status = v["status"]
            .as_str()
            .ok_or_else(|| AgentError::SchemaParse("status response missing 'status'".into()))?
            .to_ascii_lowercase();

        match status.as_str() {
            "pending" | "queued" => Ok(PollStatus::InProgress(TaskStatus::Pending)),
            "running" | "in_progress" | "processing" => {
                Ok(PollStatus::InProgress(TaskStatus::Running))
            }
            "completed" | "complete" | "succeeded" | "success" => {
                Ok(PollStatus::Completed(result_payload(&v)))
            }
            "failed" | "error" => Ok(PollStatus::Failed(error_message(&v))),
            "cancelled" | "canceled" => {
                Ok(PollStatus::Failed("cancelled by remote service".to_string()))
            }
            other => Err(AgentError::SchemaParse(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

fn result_payload(v: &serde_json::Value) -> String {
    let payload = ["result", "output", "output_text"]
        .iter()
        .find_map(|key| v.get(*key).filter(|p| !p.is_null()));
    match payload {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn error_message(v: &serde_json::Value) -> String {
    let error = &v["error"];
    error
        .as_str()
        .or_else(|| error["message"].as_str())
        .or_else(|| v["message"].as_str())
        .unwrap_or("task failed")
        .to_string()
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Measured from submission, not from the start of `wait`.
    pub timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.polling_interval,
            timeout: config.polling_timeout,
        }
    }
}

/// Called with the task after every status observation.
pub type TaskObserver = Arc<dyn Fn(&Task) + Send + Sync>;

pub struct TaskPoller {
    invoker: Arc<TransportInvoker>,
    api: Arc<dyn TaskApi>,
    request_timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
    jitter: Mutex<JitterSource>,
}

impl TaskPoller {
    pub fn new(
        invoker: Arc<TransportInvoker>,
        api: Arc<dyn TaskApi>,
        request_timeout: Duration,
    ) -> Self {
        let backoff = *invoker.backoff();
        let max_retries = invoker.max_retries();
        Self {
            invoker,
            api,
            request_timeout,
            max_retries,
            backoff,
            jitter: Mutex::new(JitterSource::from_entropy()),
        }
    }

    pub fn invoker(&self) -> &Arc<TransportInvoker> {
        &self.invoker
    }

    /// Submit `prompt` and return the new task in `pending`.
    pub async fn submit(
        &self,
        prompt: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Task, AgentError> {
        let started = Instant::now();
        let req = self.api.build_submit_request(prompt, self.request_timeout);
        let response = with_cancel(self.invoker.invoke(&req, cancel), cancel, started).await?;
        let id = self.api.parse_submit_response(&response.body)?;

        tracing::info!(
            task_id = id,
            attempts = response.attempts,
            elapsed_ms = elapsed_ms(started),
            "task submitted"
        );
        Ok(Task::submitted(id, prompt))
    }

    /// Poll `task` until it reaches a terminal status.
    ///
    /// Timeout and cancellation are reported through the task status. Errors
    /// are returned only when the service cannot be reached or keeps
    /// answering with unreadable status bodies.
    pub async fn wait(
        &self,
        mut task: Task,
        settings: &PollSettings,
        cancel: Option<&CancellationToken>,
        observer: Option<&TaskObserver>,
    ) -> Result<Task, AgentError> {
        if settings.interval.is_zero() || settings.timeout.is_zero() {
            return Err(AgentError::Config(
                "polling interval and timeout must be positive".into(),
            ));
        }

        // A timeout too large to represent as an instant never expires.
        let deadline = task.submitted_at.checked_add(settings.timeout);
        let mut malformed: u32 = 0;

        while !task.is_terminal() {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                task.cancel();
                break;
            }

            let remaining = time_left(deadline);
            if remaining.is_zero() {
                self.expire(&mut task, settings.timeout);
                break;
            }

            let req = self
                .api
                .build_status_request(task.id(), self.request_timeout.min(remaining));
            task.polls += 1;

            let checked = tokio::time::timeout(
                remaining,
                with_cancel(self.invoker.invoke(&req, cancel), cancel, task.submitted_at),
            )
            .await;

            let response = match checked {
                Err(_) => {
                    self.expire(&mut task, settings.timeout);
                    break;
                }
                Ok(Err(AgentError::Cancelled(_))) => {
                    task.cancel();
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(task_id = task.id(), polls = task.polls, "status check failed: {e}");
                    return Err(e);
                }
                Ok(Ok(response)) => response,
            };

            let delay = match self.api.parse_status_response(&response.body) {
                Ok(status) => {
                    malformed = 0;
                    self.apply(&mut task, status);
                    if let Some(notify) = observer {
                        notify(&task);
                    }
                    settings.interval
                }
                Err(e) => {
                    malformed += 1;
                    if malformed > self.max_retries {
                        tracing::error!(
                            task_id = task.id(),
                            malformed = malformed,
                            "giving up on unreadable status responses: {e}"
                        );
                        return Err(AgentError::MaxRetriesExceeded {
                            attempts: malformed,
                            last: Box::new(e),
                        });
                    }
                    tracing::warn!(
                        task_id = task.id(),
                        malformed = malformed,
                        "unreadable status response: {e}"
                    );
                    let mut rng = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
                    self.backoff.delay_for(malformed, &mut rng).jittered_delay
                }
            };

            if task.is_terminal() {
                break;
            }

            let remaining = time_left(deadline);
            if sleep_or_cancel(delay.min(remaining), cancel, task.submitted_at)
                .await
                .is_err()
            {
                task.cancel();
            }
        }

        tracing::info!(
            task_id = task.id(),
            status = task.status().as_str(),
            polls = task.polls,
            elapsed_ms = elapsed_ms(task.submitted_at),
            "task finished"
        );
        if let Some(notify) = observer
            && matches!(task.status(), TaskStatus::TimedOut | TaskStatus::Cancelled)
        {
            notify(&task);
        }
        Ok(task)
    }

    fn apply(&self, task: &mut Task, status: PollStatus) {
        match status {
            PollStatus::InProgress(progress) => {
                tracing::debug!(
                    task_id = task.id(),
                    status = progress.as_str(),
                    polls = task.polls,
                    "task in progress"
                );
                task.observe_progress(progress);
            }
            PollStatus::Completed(result) => {
                task.complete(result);
            }
            PollStatus::Failed(message) => {
                tracing::warn!(task_id = task.id(), "task failed remotely: {message}");
                task.fail(message);
            }
        }
    }

    fn expire(&self, task: &mut Task, timeout: Duration) {
        tracing::warn!(
            task_id = task.id(),
            polls = task.polls,
            "polling timed out after {:.1}s",
            timeout.as_secs_f64()
        );
        task.time_out(format!(
            "task did not finish within {:.1}s",
            timeout.as_secs_f64()
        ));
    }
}

fn time_left(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}

/// Race `fut` against `cancel`, dropping the in-flight request when it fires.
async fn with_cancel<T, F>(
    fut: F,
    cancel: Option<&CancellationToken>,
    started: Instant,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled(elapsed_ms(started))),
            result = fut => result,
        },
        None => fut.await,
    }
}
