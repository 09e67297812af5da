use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::circuit::CircuitBreakerRegistry;
use crate::dispatch::http::TransportInvoker;
use crate::dispatch::poller::{
    CodegenTaskApi, PollSettings, Task, TaskApi, TaskObserver, TaskPoller, TaskStatus,
};
use crate::error::AgentError;
use crate::github::{
    CommentOutcome, GitHubApi, GitHubCredentials, GitHubRestClient, PostResult, repo_slug,
};
use crate::normalize::{NormalizedResult, normalize};
use crate::review::{
    ReviewCommand, ReviewComment, ReviewOutcome, ReviewRequest, comments_from_result,
};

/// Comments posted concurrently per `post_pr_comments` call.
const MAX_CONCURRENT_POSTS: usize = 4;

/// Per-call knobs for [`CodegenClient::run_task`]. Unset durations fall back
/// to the client configuration.
#[derive(Clone)]
pub struct RunOptions {
    pub wait_for_completion: bool,
    pub polling_interval: Option<Duration>,
    pub polling_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub observer: Option<TaskObserver>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            polling_interval: None,
            polling_timeout: None,
            cancel: None,
            observer: None,
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("wait_for_completion", &self.wait_for_completion)
            .field("polling_interval", &self.polling_interval)
            .field("polling_timeout", &self.polling_timeout)
            .field("cancel", &self.cancel.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Entry point for running tasks against the code-generation service and
/// reviewing pull requests with it.
///
/// Circuit state is shared by every call made through one client, including
/// GitHub calls made by the default collaborator. GitHub credentials are
/// supplied per call.
pub struct CodegenClient {
    config: Config,
    circuits: Arc<CircuitBreakerRegistry>,
    poller: TaskPoller,
    github: Arc<dyn GitHubApi>,
}

impl CodegenClient {
    /// Validates `config` and attaches the GitHub REST collaborator.
    pub fn new(config: Config) -> Result<Self, AgentError> {
        config.validate()?;

        let circuits = Arc::new(CircuitBreakerRegistry::from_config(&config));
        let invoker = Arc::new(TransportInvoker::from_config(&config, circuits.clone())?);
        let api: Arc<dyn TaskApi> = Arc::new(CodegenTaskApi::from_config(&config));
        let poller = TaskPoller::new(invoker, api, config.request_timeout);

        let github: Arc<dyn GitHubApi> =
            Arc::new(GitHubRestClient::from_config(&config, circuits.clone())?);

        tracing::debug!(
            base_url = config.base_url,
            github_api_url = config.github_api_url,
            "client ready"
        );
        Ok(Self {
            config,
            circuits,
            poller,
            github,
        })
    }

    /// Replace the task API, keeping the transport and its circuits.
    pub fn with_task_api(self, api: Arc<dyn TaskApi>) -> Self {
        let poller = TaskPoller::new(
            self.poller.invoker().clone(),
            api,
            self.config.request_timeout,
        );
        Self { poller, ..self }
    }

    pub fn with_github(self, github: Arc<dyn GitHubApi>) -> Self {
        Self { github, ..self }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    /// Submit `prompt`. Returns the pending task right away when
    /// `wait_for_completion` is false, otherwise polls it to a terminal status.
    pub async fn run_task(&self, prompt: &str, options: RunOptions) -> Result<Task, AgentError> {
        if prompt.trim().is_empty() {
            return Err(AgentError::Other("prompt is empty".into()));
        }

        let cancel = options.cancel.as_ref();
        let task = self.poller.submit(prompt, cancel).await?;
        if let Some(notify) = &options.observer {
            notify(&task);
        }
        if !options.wait_for_completion {
            return Ok(task);
        }

        let settings = PollSettings {
            interval: options
                .polling_interval
                .unwrap_or(self.config.polling_interval),
            timeout: options
                .polling_timeout
                .unwrap_or(self.config.polling_timeout),
        };
        self.poller
            .wait(task, &settings, cancel, options.observer.as_ref())
            .await
    }

    /// Run a review of a pull request and map the result into comments.
    ///
    /// An unknown `review_command` or a malformed repository name fails
    /// before any network call. Without `credentials` the diff is not
    /// fetched. A diff that cannot be fetched is left out of the prompt
    /// rather than failing the review.
    pub async fn review_pull_request(
        &self,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        review_command: &str,
        credentials: Option<&GitHubCredentials>,
        options: RunOptions,
    ) -> Result<ReviewOutcome, AgentError> {
        let command: ReviewCommand = review_command.parse()?;
        let repo = repo_slug(repo_owner, repo_name)?;
        let request = ReviewRequest {
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            pr_number,
            command,
        };

        let diff = match credentials {
            Some(creds) => match self.github.get_pr_diff(&repo, pr_number, creds).await {
                Ok(diff) => Some(diff),
                Err(e) => {
                    tracing::warn!(
                        repo = repo,
                        pr = pr_number,
                        "reviewing without diff: {}",
                        e.user_message()
                    );
                    None
                }
            },
            None => None,
        };

        let prompt = request.build_prompt(diff.as_deref());
        let task = self.run_task(&prompt, options).await?;
        let result = self.normalize_task(&task);
        let comments = result.as_ref().map(comments_from_result).unwrap_or_default();

        tracing::info!(
            repo = repo,
            pr = pr_number,
            command = command.as_str(),
            status = task.status().as_str(),
            comments = comments.len(),
            "review finished"
        );
        Ok(ReviewOutcome {
            request,
            task,
            result,
            comments,
        })
    }

    /// Post each comment once with the caller's `credentials`. A failed
    /// comment never stops the rest; outcomes come back in input order.
    pub async fn post_pr_comments(
        &self,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        comments: &[ReviewComment],
        credentials: &GitHubCredentials,
    ) -> PostResult {
        let repo = match repo_slug(repo_owner, repo_name) {
            Ok(repo) => repo,
            Err(e) => {
                let error = e.user_message();
                return PostResult {
                    outcomes: (0..comments.len())
                        .map(|index| CommentOutcome {
                            index,
                            posted: false,
                            error: Some(error.clone()),
                        })
                        .collect(),
                };
            }
        };
        let github = &self.github;
        let outcomes: Vec<CommentOutcome> = stream::iter(comments.iter().enumerate())
            .map(|(index, comment)| {
                let repo = repo.as_str();
                async move {
                    match github.post_comment(repo, pr_number, comment, credentials).await {
                        Ok(()) => CommentOutcome {
                            index,
                            posted: true,
                            error: None,
                        },
                        Err(e) => {
                            tracing::warn!(
                                repo = repo,
                                pr = pr_number,
                                index = index,
                                "comment not posted: {e}"
                            );
                            CommentOutcome {
                                index,
                                posted: false,
                                error: Some(e.user_message()),
                            }
                        }
                    }
                }
            })
            .buffered(MAX_CONCURRENT_POSTS)
            .collect()
            .await;

        let result = PostResult { outcomes };
        tracing::info!(
            repo = repo,
            pr = pr_number,
            posted = result.posted_count(),
            failed = result.failed_count(),
            "comments posted"
        );
        result
    }

    /// Normalized result of a completed task; `None` for any other status.
    pub fn normalize_task(&self, task: &Task) -> Option<NormalizedResult> {
        (task.status() == TaskStatus::Completed)
            .then(|| normalize(task.result().unwrap_or_default()))
    }
}
