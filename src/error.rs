//! Error types for agent-validator operations.
//!
//! Defines the error taxonomy for every subsystem:
//! - Repository fetching (clone into an ephemeral working copy)
//! - Agent loading, capability checking and execution
//! - Task input / output handling
//! - Validator configuration

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while materializing a repository locally.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Repository reference is empty")]
    EmptyReference,

    #[error("Failed to create working copy: {0}")]
    WorkingCopy(#[source] std::io::Error),

    #[error("Failed to spawn clone tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Clone failed with exit code {}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none (signal)".to_string()))]
    CloneFailed { exit_code: Option<i32> },

    #[error("Clone timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur while running one candidate through the pipeline.
///
/// Every variant is terminal for its candidate only: the runner converts it
/// into a failed [`crate::runner::PipelineOutcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Entry point not found: {}", .0.display())]
    MissingEntryPoint(PathBuf),

    #[error("Agent failed to load: {0}")]
    Load(String),

    #[error("Agent does not expose a usable `run`: {0}")]
    MissingCapability(String),

    #[error("Task file not found: {}", .0.display())]
    TaskFileNotFound(PathBuf),

    #[error("Failed to parse task file {}: {source}", path.display())]
    TaskParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Agent execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Failed to write output to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Returns a stable label for this error kind, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Fetch(_) => "fetch_error",
            PipelineError::MissingEntryPoint(_) => "missing_entry_point",
            PipelineError::Load(_) => "load_error",
            PipelineError::MissingCapability(_) => "missing_capability",
            PipelineError::TaskFileNotFound(_) => "task_file_not_found",
            PipelineError::TaskParse { .. } => "task_parse_error",
            PipelineError::ExecutionTimeout(_) => "execution_timeout",
            PipelineError::Execution(_) => "execution_error",
            PipelineError::Persist { .. } => "persist_error",
        }
    }
}

/// Errors raised by the validator loop's external collaborators.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("Peer query failed: {0}")]
    PeerQuery(String),

    #[error("Reward update failed: {0}")]
    RewardSink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct() {
        let errors = vec![
            PipelineError::Fetch(FetchError::EmptyReference),
            PipelineError::MissingEntryPoint(PathBuf::from("agent.py")),
            PipelineError::Load("boom".into()),
            PipelineError::MissingCapability("no run".into()),
            PipelineError::TaskFileNotFound(PathBuf::from("task.json")),
            PipelineError::TaskParse {
                path: PathBuf::from("task.json"),
                source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            },
            PipelineError::ExecutionTimeout(Duration::from_secs(1)),
            PipelineError::Execution("raised".into()),
            PipelineError::Persist {
                path: PathBuf::from("output.json"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            },
        ];

        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_clone_failed_display() {
        let err = FetchError::CloneFailed { exit_code: Some(128) };
        assert!(err.to_string().contains("128"));

        let err = FetchError::CloneFailed { exit_code: None };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_fetch_error_converts() {
        let err: PipelineError = FetchError::Timeout(Duration::from_secs(30)).into();
        assert!(matches!(err, PipelineError::Fetch(FetchError::Timeout(_))));
        assert_eq!(err.kind(), "fetch_error");
        assert!(err.to_string().contains("timed out"));
    }
}
