use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;
use crate::dispatch::TransportRequest;
use crate::dispatch::backoff::BackoffPolicy;
use crate::dispatch::circuit::CircuitBreakerRegistry;
use crate::dispatch::http::TransportInvoker;
use crate::error::AgentError;
use crate::review::ReviewComment;

const USER_AGENT: &str = "codegen-agent";

#[derive(Clone)]
pub struct GitHubCredentials {
    pub token: String,
}

impl GitHubCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .github_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

impl std::fmt::Debug for GitHubCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// `owner/name` for use in REST paths. Each segment must be non-empty, must
/// not be `.` or `..`, and may only use the characters GitHub allows in
/// account and repository names.
pub fn repo_slug(owner: &str, name: &str) -> Result<String, AgentError> {
    let valid = |segment: &str| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if valid(owner) && valid(name) {
        Ok(format!("{owner}/{name}"))
    } else {
        Err(AgentError::GitHub(format!(
            "invalid repository '{owner}/{name}'"
        )))
    }
}

fn checked_repo(repo: &str) -> Result<String, AgentError> {
    match repo.split_once('/') {
        Some((owner, name)) => repo_slug(owner, name),
        None => Err(AgentError::GitHub(format!("invalid repository '{repo}'"))),
    }
}

/// Pull request operations the agent needs from GitHub. `repo` is
/// `owner/name`.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    async fn get_pr_diff(
        &self,
        repo: &str,
        pr_number: u64,
        credentials: &GitHubCredentials,
    ) -> Result<String, AgentError>;

    async fn post_comment(
        &self,
        repo: &str,
        pr_number: u64,
        comment: &ReviewComment,
        credentials: &GitHubCredentials,
    ) -> Result<(), AgentError>;
}

/// GitHub REST client. Calls go through a [`TransportInvoker`], so they get
/// the same retry and circuit-breaker treatment as the task API.
pub struct GitHubRestClient {
    invoker: TransportInvoker,
    request_timeout: Duration,
}

impl GitHubRestClient {
    pub fn new(invoker: TransportInvoker, request_timeout: Duration) -> Self {
        Self {
            invoker,
            request_timeout,
        }
    }

    pub fn from_config(
        config: &Config,
        circuits: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, AgentError> {
        let invoker = TransportInvoker::new(
            config.github_api_url.clone(),
            circuits,
            BackoffPolicy::from_config(config),
            config.max_retries,
        )?;
        Ok(Self::new(invoker, config.request_timeout))
    }

    fn authorized(
        &self,
        req: TransportRequest,
        credentials: &GitHubCredentials,
    ) -> Result<TransportRequest, AgentError> {
        if credentials.token.trim().is_empty() {
            return Err(AgentError::GitHub("no GitHub token configured".into()));
        }
        Ok(req
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28"))
    }
}

#[async_trait]
impl GitHubApi for GitHubRestClient {
    async fn get_pr_diff(
        &self,
        repo: &str,
        pr_number: u64,
        credentials: &GitHubCredentials,
    ) -> Result<String, AgentError> {
        let repo = checked_repo(repo)?;
        let req = TransportRequest::get(
            format!("/repos/{repo}/pulls/{pr_number}"),
            "GET /repos/{repo}/pulls/{pr}",
            self.request_timeout,
        )
        .header("Accept", "application/vnd.github.v3.diff");
        let req = self.authorized(req, credentials)?;

        let response = self.invoker.invoke(&req, None).await?;
        String::from_utf8(response.body)
            .map_err(|_| AgentError::GitHub(format!("diff for {repo}#{pr_number} is not UTF-8")))
    }

    async fn post_comment(
        &self,
        repo: &str,
        pr_number: u64,
        comment: &ReviewComment,
        credentials: &GitHubCredentials,
    ) -> Result<(), AgentError> {
        let repo = checked_repo(repo)?;
        let req = match (&comment.path, comment.line) {
            (Some(path), Some(line)) if comment.is_inline() => TransportRequest::post(
                format!("/repos/{repo}/pulls/{pr_number}/reviews"),
                "POST /repos/{repo}/pulls/{pr}/reviews",
                serde_json::json!({
                    "event": "COMMENT",
                    "comments": [{
                        "path": path,
                        "line": line,
                        "side": "RIGHT",
                        "body": comment.body,
                    }],
                }),
                self.request_timeout,
            ),
            _ => TransportRequest::post(
                format!("/repos/{repo}/issues/{pr_number}/comments"),
                "POST /repos/{repo}/issues/{pr}/comments",
                serde_json::json!({ "body": comment.body }),
                self.request_timeout,
            ),
        }
        .header("Accept", "application/vnd.github+json");
        let req = self.authorized(req, credentials)?;

        self.invoker.invoke(&req, None).await?;
        tracing::debug!(
            repo = repo,
            pr = pr_number,
            inline = comment.is_inline(),
            "comment posted"
        );
        Ok(())
    }
}

/// Outcome of posting one comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentOutcome {
    /// Position in the input list.
    pub index: usize,
    pub posted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-comment outcomes, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostResult {
    pub outcomes: Vec<CommentOutcome>,
}

impl PostResult {
    pub fn posted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.posted).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.posted_count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }

    /// Some comments were posted and some were not.
    pub fn is_partial(&self) -> bool {
        self.posted_count() > 0 && self.failed_count() > 0
    }
}

/// Parse `owner/repo#number`.
pub fn parse_pr_reference(pr_ref: &str) -> Result<(String, String, u64), AgentError> {
    let invalid = || {
        AgentError::Config(format!(
            "invalid PR reference '{pr_ref}', expected owner/repo#number"
        ))
    };
    let (owner_repo, number) = pr_ref.trim().split_once('#').ok_or_else(invalid)?;
    let (owner, repo) = owner_repo.split_once('/').ok_or_else(invalid)?;
    repo_slug(owner, repo).map_err(|_| invalid())?;
    let number: u64 = number
        .parse()
        .map_err(|_| AgentError::Config(format!("invalid PR number: {number}")))?;
    Ok((owner.to_string(), repo.to_string(), number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_pr_reference() {
        let (owner, repo, num) = parse_pr_reference("rust-lang/rust#12345").unwrap();
        assert_eq!(owner, "rust-lang");
        assert_eq!(repo, "rust");
        assert_eq!(num, 12345);
    }

    #[test]
    fn parse_pr_reference_rejects_malformed() {
        for bad in ["owner/repo", "repo#123", "owner/repo#abc", "/repo#1", "a/b/c#1"] {
            assert!(parse_pr_reference(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = GitHubCredentials::new("ghp_secret");
        assert!(!format!("{creds:?}").contains("ghp_secret"));
    }

    #[test]
    fn credentials_from_config_ignore_blank_token() {
        let mut config = Config::default();
        assert!(GitHubCredentials::from_config(&config).is_none());
        config.github_token = Some("  ".into());
        assert!(GitHubCredentials::from_config(&config).is_none());
        config.github_token = Some("ghp_x".into());
        assert_eq!(GitHubCredentials::from_config(&config).unwrap().token, "ghp_x");
    }

    #[test]
    fn post_result_counts() {
        let result = PostResult {
            outcomes: vec![
                CommentOutcome {
                    index: 0,
                    posted: true,
                    error: None,
                },
                CommentOutcome {
                    index: 1,
                    posted: false,
                    error: Some("boom".into()),
                },
            ],
        };
        assert_eq!(result.posted_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert!(result.is_partial());
        assert!(!result.is_complete());
        assert!(PostResult::default().is_complete());
    }
}
