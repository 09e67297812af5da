pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod github;
pub mod normalize;
pub mod review;

pub use client::{CodegenClient, RunOptions};
pub use config::{Config, ConfigOverrides};
pub use dispatch::poller::{Task, TaskStatus};
pub use error::AgentError;
pub use normalize::{NormalizedResult, normalize};
