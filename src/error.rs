use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid review command: {command} (expected one of {expected})")]
    InvalidReviewCommand { command: String, expected: String },

    #[error("circuit open for {target}, retry in {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    #[error("giving up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<AgentError>,
    },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {target}")]
    RateLimited {
        target: String,
        retry_after_secs: Option<u64>,
    },

    #[error("upstream error from {target}: {message}")]
    Upstream {
        target: String,
        message: String,
        status: Option<u16>,
    },

    #[error("transport error for {target}: {message}")]
    Transport { target: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("github error: {0}")]
    GitHub(String),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Circuit target the error was raised for, if the variant carries one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { target, .. } => Some(target),
            Self::RateLimited { target, .. } => Some(target),
            Self::Upstream { target, .. } => Some(target),
            Self::Transport { target, .. } => Some(target),
            Self::MaxRetriesExceeded { last, .. } => last.target(),
            _ => None,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Transport { .. } => true,
            Self::Upstream { status, .. } => {
                // status: None = not an HTTP status (oversized body etc.), not retryable
                status.is_some_and(|s| s >= 500 || s == 429)
            }
            Self::Request(_) => true,
            Self::SchemaParse(_) => true,
            _ => false,
        }
    }

    /// Sanitized message for CLI output and logs shown to end users.
    /// Does not leak URLs, tokens or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => format!("invalid configuration: {msg}"),
            Self::InvalidReviewCommand { command, expected } => {
                format!("unknown review command '{command}', expected one of: {expected}")
            }
            Self::CircuitOpen {
                target,
                retry_after_ms,
            } => format!(
                "{target} is failing repeatedly, calls suspended for {}s",
                retry_after_ms.div_ceil(1000)
            ),
            Self::MaxRetriesExceeded { attempts, last } => {
                format!("gave up after {attempts} attempts: {}", last.user_message())
            }
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { target, .. } => {
                format!("rate limited by {target}, try again shortly")
            }
            Self::Upstream {
                target, status, ..
            } => match status {
                Some(code) => format!("{target} returned HTTP {code}"),
                None => format!("{target} returned an unusable response"),
            },
            Self::Transport { target, .. } => format!("could not reach {target}"),
            Self::SchemaParse(_) => "failed to parse service response".to_string(),
            Self::Request(_) => "request to service failed".to_string(),
            Self::GitHub(msg) => format!("github: {msg}"),
            Self::Cancelled(ms) => format!("cancelled after {ms}ms"),
            Self::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_retries_reports_inner_target() {
        let err = AgentError::MaxRetriesExceeded {
            attempts: 4,
            last: Box::new(AgentError::Upstream {
                target: "POST /tasks".to_string(),
                message: "502 Bad Gateway".to_string(),
                status: Some(502),
            }),
        };
        assert_eq!(err.target(), Some("POST /tasks"));
        assert!(!err.is_retryable());
        assert_eq!(
            err.user_message(),
            "gave up after 4 attempts: POST /tasks returned HTTP 502"
        );
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = AgentError::Upstream {
            target: "GET /tasks/{task_id}".to_string(),
            message: "404 Not Found".to_string(),
            status: Some(404),
        };
        assert!(!err.is_retryable());
        assert!(
            AgentError::Upstream {
                target: "x".to_string(),
                message: String::new(),
                status: Some(503),
            }
            .is_retryable()
        );
    }

    #[test]
    fn circuit_open_is_not_retryable_and_rounds_up() {
        let err = AgentError::CircuitOpen {
            target: "POST /tasks".to_string(),
            retry_after_ms: 1500,
        };
        assert!(!err.is_retryable());
        assert!(err.user_message().contains("2s"));
    }

    #[test]
    fn user_message_hides_upstream_body() {
        let err = AgentError::Upstream {
            target: "POST /tasks".to_string(),
            message: "500: stack trace with https://internal.example".to_string(),
            status: Some(500),
        };
        assert!(!err.user_message().contains("internal.example"));
    }
}
