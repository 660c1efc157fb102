//! agent-validator: fetch peer-submitted agents, run them, score them.
//!
//! This library provides the untrusted-code pipeline of a network validator:
//! cloning a peer's repository, loading its agent entry point in an isolated
//! process, running it against a task, and rewarding the submission.

pub mod cli;
pub mod config;
pub mod error;
pub mod reward;
pub mod runner;
pub mod validator;

// Re-export commonly used types
pub use config::ValidatorConfig;
pub use error::{ConfigError, FetchError, PipelineError, ValidatorError};
pub use reward::{get_rewards, reward, PeerResponse, RewardMode, Scorer};
pub use runner::{AgentRunner, PipelineOutcome, RunConfig};
