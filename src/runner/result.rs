//! Result types for pipeline runs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// The agent ran and its output was persisted.
    Succeeded,
    /// Some stage failed; no output was produced.
    Failed,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Succeeded => write!(f, "succeeded"),
            PipelineStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of running one repository reference through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Unique identifier for this run.
    pub run_id: String,
    /// Repository reference that was fetched.
    pub reference: String,
    /// Terminal status.
    pub status: PipelineStatus,
    /// Error kind label, when the run failed.
    pub error_kind: Option<String>,
    /// Error message, when the run failed.
    pub error: Option<String>,
    /// The agent's output, when the run succeeded.
    pub output: Option<Value>,
    /// Where the output was written.
    pub output_path: Option<PathBuf>,
    /// Wall-clock duration of the whole pipeline.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub finished_at: DateTime<Utc>,
}

impl PipelineOutcome {
    /// Creates a successful outcome.
    pub fn success(
        run_id: impl Into<String>,
        reference: impl Into<String>,
        output: Value,
        output_path: PathBuf,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            reference: reference.into(),
            status: PipelineStatus::Succeeded,
            error_kind: None,
            error: None,
            output: Some(output),
            output_path: Some(output_path),
            duration,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Creates a failed outcome.
    pub fn failure(
        run_id: impl Into<String>,
        reference: impl Into<String>,
        error: &PipelineError,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            reference: reference.into(),
            status: PipelineStatus::Failed,
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
            output: None,
            output_path: None,
            duration,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Checks if the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// The task output, or `None` for "no result".
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_outcome() {
        let outcome = PipelineOutcome::success(
            "run-1",
            "https://github.com/a/b",
            json!({"a": 1}),
            PathBuf::from("output.json"),
            Utc::now(),
            Duration::from_millis(1500),
        );
        assert!(outcome.is_success());
        assert_eq!(outcome.output(), Some(&json!({"a": 1})));
        assert!(outcome.error_kind.is_none());
    }

    #[test]
    fn test_failure_outcome() {
        let err = PipelineError::MissingEntryPoint(PathBuf::from("agent.py"));
        let outcome = PipelineOutcome::failure(
            "run-2",
            "https://github.com/a/b",
            &err,
            Utc::now(),
            Duration::from_secs(1),
        );
        assert!(!outcome.is_success());
        assert!(outcome.output().is_none());
        assert_eq!(outcome.error_kind.as_deref(), Some("missing_entry_point"));
        assert!(outcome.error.unwrap().contains("agent.py"));
    }

    #[test]
    fn test_outcome_serializes_duration_as_millis() {
        let err = PipelineError::Load("boom".into());
        let outcome =
            PipelineOutcome::failure("r", "ref", &err, Utc::now(), Duration::from_millis(250));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["duration"], json!(250));
        assert_eq!(value["status"], json!("failed"));

        let back: PipelineOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back.duration, Duration::from_millis(250));
    }
}
