use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AgentError;

/// Default location of the optional config file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "code_agent_config.toml";

pub const DEFAULT_BASE_URL: &str = "https://api.codegen.com";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Resolved client configuration.
///
/// Layering, lowest to highest precedence: built-in defaults, the TOML file,
/// `CODEGEN_*` environment variables, then [`ConfigOverrides`] passed by the
/// caller.
#[derive(Clone)]
pub struct Config {
    pub api_key: String,
    pub org_id: String,
    pub base_url: String,
    /// Path for task submission. `{org_id}` is substituted.
    pub submit_path: String,
    /// Path for status checks. `{org_id}` and `{task_id}` are substituted.
    pub status_path: String,
    pub max_retries: u32,
    /// Base delay for retry backoff.
    pub retry_delay: Duration,
    /// Cap on computed backoff delays.
    pub max_retry_delay: Duration,
    /// Symmetric jitter applied to backoff delays, as a fraction in [0, 1].
    pub jitter_fraction: f64,
    pub polling_interval: Duration,
    pub polling_timeout: Duration,
    pub request_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_recovery_time: Duration,
    pub github_api_url: String,
    pub github_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            org_id: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            submit_path: "/tasks".to_string(),
            status_path: "/tasks/{task_id}".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            jitter_fraction: 0.2,
            polling_interval: Duration::from_secs(10),
            polling_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_time: Duration::from_secs(60),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            github_token: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"[REDACTED]")
            .field("org_id", &self.org_id)
            .field("base_url", &self.base_url)
            .field("submit_path", &self.submit_path)
            .field("status_path", &self.status_path)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("polling_interval", &self.polling_interval)
            .field("polling_timeout", &self.polling_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("circuit_breaker_threshold", &self.circuit_breaker_threshold)
            .field(
                "circuit_breaker_recovery_time",
                &self.circuit_breaker_recovery_time,
            )
            .field("github_api_url", &self.github_api_url)
            .field(
                "github_token",
                &self.github_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// On-disk shape of the config file. Durations are seconds (fractional allowed).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub org_id: Option<String>,
    pub base_url: Option<String>,
    pub submit_path: Option<String>,
    pub status_path: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<f64>,
    pub max_retry_delay: Option<f64>,
    pub jitter_fraction: Option<f64>,
    pub polling_interval: Option<f64>,
    pub polling_timeout: Option<f64>,
    pub request_timeout: Option<f64>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_recovery_time: Option<f64>,
    pub github_api_url: Option<String>,
    pub github_token: Option<String>,
}

/// Constructor-level parameters. Anything set here wins over file and env.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub api_key: Option<String>,
    pub org_id: Option<String>,
    pub base_url: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub polling_interval: Option<Duration>,
    pub polling_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_recovery_time: Option<Duration>,
    pub github_token: Option<String>,
}

impl Config {
    /// Defaults overlaid with `CODEGEN_*` / `GITHUB_TOKEN` environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Full layering: defaults, optional TOML file, environment, overrides.
    ///
    /// `path = None` looks for [`DEFAULT_CONFIG_FILE`] and skips it when absent;
    /// an explicit path must exist.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, AgentError> {
        Self::load_with(path, overrides, |key| env::var(key).ok())
    }

    /// [`Config::load`] with an injectable environment lookup.
    pub fn load_with<F>(
        path: Option<&Path>,
        overrides: ConfigOverrides,
        lookup: F,
    ) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        match path {
            Some(p) => config.apply_file(&read_file_config(p)?)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    config.apply_file(&read_file_config(default_path)?)?;
                }
            }
        }

        config.apply_env(lookup)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: &FileConfig) -> Result<(), AgentError> {
        if let Some(v) = &file.api_key {
            self.api_key = v.clone();
        }
        if let Some(v) = &file.org_id {
            self.org_id = v.clone();
        }
        if let Some(v) = &file.base_url {
            self.base_url = v.clone();
        }
        if let Some(v) = &file.submit_path {
            self.submit_path = v.clone();
        }
        if let Some(v) = &file.status_path {
            self.status_path = v.clone();
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.retry_delay {
            self.retry_delay = seconds("retry_delay", v)?;
        }
        if let Some(v) = file.max_retry_delay {
            self.max_retry_delay = seconds("max_retry_delay", v)?;
        }
        if let Some(v) = file.jitter_fraction {
            self.jitter_fraction = v;
        }
        if let Some(v) = file.polling_interval {
            self.polling_interval = seconds("polling_interval", v)?;
        }
        if let Some(v) = file.polling_timeout {
            self.polling_timeout = seconds("polling_timeout", v)?;
        }
        if let Some(v) = file.request_timeout {
            self.request_timeout = seconds("request_timeout", v)?;
        }
        if let Some(v) = file.circuit_breaker_threshold {
            self.circuit_breaker_threshold = v;
        }
        if let Some(v) = file.circuit_breaker_recovery_time {
            self.circuit_breaker_recovery_time = seconds("circuit_breaker_recovery_time", v)?;
        }
        if let Some(v) = &file.github_api_url {
            self.github_api_url = v.clone();
        }
        if let Some(v) = &file.github_token {
            self.github_token = Some(v.clone());
        }
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CODEGEN_TOKEN") {
            self.api_key = v;
        }
        if let Some(v) = get("CODEGEN_ORG_ID") {
            self.org_id = v;
        }
        if let Some(v) = get("CODEGEN_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("CODEGEN_MAX_RETRIES") {
            self.max_retries = v.trim().parse().map_err(|e| {
                AgentError::Config(format!("CODEGEN_MAX_RETRIES={v:?}: {e}"))
            })?;
        }
        if let Some(v) = get("CODEGEN_RETRY_DELAY") {
            self.retry_delay = env_seconds("CODEGEN_RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("CODEGEN_POLLING_INTERVAL") {
            self.polling_interval = env_seconds("CODEGEN_POLLING_INTERVAL", &v)?;
        }
        if let Some(v) = get("CODEGEN_POLLING_TIMEOUT") {
            self.polling_timeout = env_seconds("CODEGEN_POLLING_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CODEGEN_REQUEST_TIMEOUT") {
            self.request_timeout = env_seconds("CODEGEN_REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CODEGEN_CIRCUIT_BREAKER_THRESHOLD") {
            self.circuit_breaker_threshold = v.trim().parse().map_err(|e| {
                AgentError::Config(format!("CODEGEN_CIRCUIT_BREAKER_THRESHOLD={v:?}: {e}"))
            })?;
        }
        if let Some(v) = get("CODEGEN_CIRCUIT_BREAKER_RECOVERY_TIME") {
            self.circuit_breaker_recovery_time =
                env_seconds("CODEGEN_CIRCUIT_BREAKER_RECOVERY_TIME", &v)?;
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.github_token = Some(v);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            api_key,
            org_id,
            base_url,
            max_retries,
            retry_delay,
            polling_interval,
            polling_timeout,
            request_timeout,
            circuit_breaker_threshold,
            circuit_breaker_recovery_time,
            github_token,
        } = overrides;

        if let Some(v) = api_key {
            self.api_key = v;
        }
        if let Some(v) = org_id {
            self.org_id = v;
        }
        if let Some(v) = base_url {
            self.base_url = v;
        }
        if let Some(v) = max_retries {
            self.max_retries = v;
        }
        if let Some(v) = retry_delay {
            self.retry_delay = v;
        }
        if let Some(v) = polling_interval {
            self.polling_interval = v;
        }
        if let Some(v) = polling_timeout {
            self.polling_timeout = v;
        }
        if let Some(v) = request_timeout {
            self.request_timeout = v;
        }
        if let Some(v) = circuit_breaker_threshold {
            self.circuit_breaker_threshold = v;
        }
        if let Some(v) = circuit_breaker_recovery_time {
            self.circuit_breaker_recovery_time = v;
        }
        if let Some(v) = github_token {
            self.github_token = Some(v);
        }
    }

    /// Every violated constraint, in declaration order. Empty means valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.api_key.trim().is_empty() {
            problems.push("api_key is not set (CODEGEN_TOKEN)".to_string());
        }
        if self.org_id.trim().is_empty() {
            problems.push("org_id is not set (CODEGEN_ORG_ID)".to_string());
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            problems.push(format!("base_url must be an http(s) URL: {}", self.base_url));
        }
        if !self.status_path.contains("{task_id}") {
            problems.push("status_path must contain {task_id}".to_string());
        }
        if self.retry_delay.is_zero() {
            problems.push("retry_delay must be > 0".to_string());
        }
        if self.max_retry_delay < self.retry_delay {
            problems.push("max_retry_delay must be >= retry_delay".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            problems.push(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        if self.polling_interval.is_zero() {
            problems.push("polling_interval must be > 0".to_string());
        }
        if self.polling_timeout.is_zero() {
            problems.push("polling_timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            problems.push("request_timeout must be > 0".to_string());
        }
        if self.circuit_breaker_threshold == 0 {
            problems.push("circuit_breaker_threshold must be >= 1".to_string());
        }
        if self.circuit_breaker_recovery_time.is_zero() {
            problems.push("circuit_breaker_recovery_time must be > 0".to_string());
        }

        problems
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(problems.join("; ")))
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, AgentError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text)
        .map_err(|e| AgentError::Config(format!("cannot parse {}: {e}", path.display())))
}

fn seconds(name: &str, value: f64) -> Result<Duration, AgentError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| AgentError::Config(format!("{name} must be a non-negative number of seconds")))
}

fn env_seconds(name: &str, raw: &str) -> Result<Duration, AgentError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|e| AgentError::Config(format!("{name}={raw:?}: {e}")))?;
    seconds(name, value)
}
