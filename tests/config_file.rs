//! TOML config file layering under environment and constructor overrides.

use std::io::Write;
use std::time::Duration;

use codegen_agent::config::{Config, ConfigOverrides};
use codegen_agent::error::AgentError;

fn no_env(_: &str) -> Option<String> {
    None
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn file_values_apply_over_defaults() {
    let file = write_config(
        r#"
api_key = "file-token"
org_id = "file-org"
base_url = "https://codegen.internal.example"
status_path = "/v1/organizations/{org_id}/tasks/{task_id}"
max_retries = 5
retry_delay = 0.25
polling_interval = 3
circuit_breaker_threshold = 2
"#,
    );

    let config = Config::load_with(Some(file.path()), ConfigOverrides::default(), no_env).unwrap();
    assert_eq!(config.api_key, "file-token");
    assert_eq!(config.org_id, "file-org");
    assert_eq!(config.base_url, "https://codegen.internal.example");
    assert_eq!(config.status_path, "/v1/organizations/{org_id}/tasks/{task_id}");
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.retry_delay, Duration::from_millis(250));
    assert_eq!(config.polling_interval, Duration::from_secs(3));
    assert_eq!(config.circuit_breaker_threshold, 2);
    // Untouched keys keep their defaults.
    assert_eq!(config.polling_timeout, Duration::from_secs(300));
}

#[test]
fn env_beats_file_and_overrides_beat_env() {
    let file = write_config("api_key = \"file-token\"\norg_id = \"file-org\"\nmax_retries = 5\n");
    let env = |key: &str| match key {
        "CODEGEN_MAX_RETRIES" => Some("1".to_string()),
        "CODEGEN_ORG_ID" => Some("env-org".to_string()),
        _ => None,
    };
    let overrides = ConfigOverrides {
        org_id: Some("ctor-org".to_string()),
        ..Default::default()
    };

    let config = Config::load_with(Some(file.path()), overrides, env).unwrap();
    assert_eq!(config.api_key, "file-token");
    assert_eq!(config.max_retries, 1);
    assert_eq!(config.org_id, "ctor-org");
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config("api_key = \"t\"\norg_id = \"o\"\npoll_every = 3\n");
    let err = Config::load_with(Some(file.path()), ConfigOverrides::default(), no_env).unwrap_err();
    assert!(matches!(err, AgentError::Config(msg) if msg.contains("poll_every")));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = Config::load_with(Some(&missing), ConfigOverrides::default(), no_env).unwrap_err();
    assert!(matches!(err, AgentError::Config(_)));
}

#[test]
fn invalid_result_lists_every_problem() {
    let file = write_config("request_timeout = 0\ncircuit_breaker_recovery_time = 0\n");
    let err = Config::load_with(Some(file.path()), ConfigOverrides::default(), no_env)
        .unwrap_err()
        .to_string();
    for field in ["api_key", "org_id", "request_timeout", "circuit_breaker_recovery_time"] {
        assert!(err.contains(field), "missing {field} in: {err}");
    }
}
