use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use codegen_agent::client::{CodegenClient, RunOptions};
use codegen_agent::config::{Config, ConfigOverrides};
use codegen_agent::dispatch::poller::{Task, TaskObserver, TaskStatus};
use codegen_agent::github::{GitHubCredentials, parse_pr_reference};

#[derive(Parser)]
#[command(
    name = "codegen-agent",
    version,
    about = "Run code-generation tasks and pull request reviews against the Codegen API",
    long_about = "Submits tasks to the Codegen API and polls them to completion.\n\n\
                   Examples:\n  \
                     codegen-agent run 'add a --verbose flag'          Run a task and wait\n  \
                     codegen-agent run 'triage #12' --no-wait          Submit and print the pending task\n  \
                     codegen-agent review octo/widgets#7 /review       Review a pull request\n  \
                     codegen-agent review octo/widgets#7 /improve --post  Review and post comments"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: code_agent_config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a prompt as a task
    Run {
        prompt: String,

        /// Return the pending task without polling
        #[arg(long)]
        no_wait: bool,

        /// Seconds between status checks
        #[arg(long)]
        polling_interval: Option<f64>,

        /// Seconds to wait for completion, counted from submission
        #[arg(long)]
        polling_timeout: Option<f64>,
    },
    /// Review a pull request (owner/repo#number)
    Review {
        pr: String,

        /// One of /review, /gemini-review, /korbit-review, /improve
        command: String,

        /// Post the resulting comments to the pull request
        #[arg(long)]
        post: bool,
    },
}

fn seconds(flag: &str, value: Option<f64>) -> anyhow::Result<Option<Duration>> {
    value
        .map(|v| Duration::try_from_secs_f64(v).with_context(|| format!("--{flag} must be >= 0")))
        .transpose()
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

fn progress_observer() -> TaskObserver {
    Arc::new(|task: &Task| {
        tracing::info!(
            task_id = task.id(),
            status = task.status().as_str(),
            polls = task.polls(),
            "task update"
        );
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref(), ConfigOverrides::default())
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let credentials = GitHubCredentials::from_config(&config);
    let client = CodegenClient::new(config).map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Command::Run {
            prompt,
            no_wait,
            polling_interval,
            polling_timeout,
        } => {
            let options = RunOptions {
                wait_for_completion: !no_wait,
                polling_interval: seconds("polling-interval", polling_interval)?,
                polling_timeout: seconds("polling-timeout", polling_timeout)?,
                cancel: Some(cancel),
                observer: Some(progress_observer()),
            };
            let task = client
                .run_task(&prompt, options)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;

            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(match task.status() {
                TaskStatus::Completed | TaskStatus::Pending | TaskStatus::Running => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            })
        }
        Command::Review { pr, command, post } => {
            let (owner, repo, number) =
                parse_pr_reference(&pr).map_err(|e| anyhow::anyhow!(e.user_message()))?;
            let options = RunOptions {
                cancel: Some(cancel),
                observer: Some(progress_observer()),
                ..RunOptions::default()
            };
            let outcome = client
                .review_pull_request(
                    &owner,
                    &repo,
                    number,
                    &command,
                    credentials.as_ref(),
                    options,
                )
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.task.status() != TaskStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }

            if post {
                let credentials =
                    credentials.context("posting comments requires GITHUB_TOKEN")?;
                let result = client
                    .post_pr_comments(&owner, &repo, number, &outcome.comments, &credentials)
                    .await;
                println!("{}", serde_json::to_string_pretty(&result)?);
                if !result.is_complete() {
                    return Ok(ExitCode::FAILURE);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
