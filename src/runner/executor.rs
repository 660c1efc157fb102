//! Agent runner - drives one reference through fetch, load, execute, persist.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::RunConfig;
use super::fetcher::Fetcher;
use super::loader::AgentLoader;
use super::result::PipelineOutcome;
use crate::error::PipelineError;

/// Runs untrusted agents from repository references.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: RunConfig,
    fetcher: Fetcher,
    loader: AgentLoader,
}

impl AgentRunner {
    /// Creates a new agent runner with the given configuration.
    pub fn new(config: RunConfig) -> Self {
        let fetcher = Fetcher::from_config(&config);
        let loader = AgentLoader::from_config(&config);
        Self {
            config,
            fetcher,
            loader,
        }
    }

    /// Returns the run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the full pipeline for `reference`.
    ///
    /// Never fails: every error becomes a failed [`PipelineOutcome`]. The
    /// working copy is gone by the time this returns.
    pub async fn run(&self, reference: &str, task_path: &Path, output_path: &Path) -> PipelineOutcome {
        let run_id = format!("run-{}", Uuid::new_v4());
        let started_at = Utc::now();
        let start = Instant::now();

        info!(run_id = %run_id, reference = %reference, "Starting pipeline");

        match self.execute(reference, task_path, output_path).await {
            Ok(output) => {
                let duration = start.elapsed();
                info!(
                    run_id = %run_id,
                    reference = %reference,
                    output = %output_path.display(),
                    elapsed_ms = duration.as_millis() as u64,
                    "Agent run succeeded"
                );
                PipelineOutcome::success(
                    run_id,
                    reference,
                    output,
                    output_path.to_path_buf(),
                    started_at,
                    duration,
                )
            }
            Err(e) => {
                let duration = start.elapsed();
                warn!(
                    run_id = %run_id,
                    reference = %reference,
                    kind = e.kind(),
                    error = %e,
                    "Pipeline failed"
                );
                PipelineOutcome::failure(run_id, reference, &e, started_at, duration)
            }
        }
    }

    async fn execute(
        &self,
        reference: &str,
        task_path: &Path,
        output_path: &Path,
    ) -> Result<Value, PipelineError> {
        let copy = self.fetcher.fetch(reference).await?;

        let module = self.loader.load(&copy).await?;
        let input = read_task_input(task_path)?;
        debug!(reference = %reference, task = %task_path.display(), "Task input loaded");

        let output = module.run(&input).await?;
        persist_output(output_path, &output)?;

        if let Err(e) = copy.close() {
            warn!(reference = %reference, error = %e, "Failed to remove working copy");
        }
        Ok(output)
    }
}

/// Reads and parses the task input file.
pub fn read_task_input(path: &Path) -> Result<Value, PipelineError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(task = %path.display(), error = %e, "Task file unreadable");
        }
        PipelineError::TaskFileNotFound(path.to_path_buf())
    })?;

    serde_json::from_str(&content).map_err(|source| PipelineError::TaskParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `output` as pretty JSON, replacing `path` atomically.
///
/// The destination is only touched once the full document is on disk.
pub fn persist_output(path: &Path, output: &Value) -> Result<(), PipelineError> {
    let persist_err = |source: std::io::Error| PipelineError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_string_pretty(output)
        .map_err(|e| persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    tmp.write_all(json.as_bytes()).map_err(persist_err)?;
    tmp.write_all(b"\n").map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;

    debug!(output = %path.display(), "Saved task output");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_read_task_input() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("task.json");
        fs::write(&path, r#"{"a": 1, "b": [true, null]}"#).unwrap();

        let input = read_task_input(&path).unwrap();
        assert_eq!(input, json!({"a": 1, "b": [true, null]}));
    }

    #[test]
    fn test_read_task_input_missing() {
        let temp = TempDir::new().unwrap();
        let err = read_task_input(&temp.path().join("nope.json")).unwrap_err();
        assert_eq!(err.kind(), "task_file_not_found");
    }

    #[test]
    fn test_read_task_input_malformed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("task.json");
        fs::write(&path, "{not json").unwrap();

        let err = read_task_input(&path).unwrap_err();
        assert!(matches!(err, PipelineError::TaskParse { .. }));
    }

    #[test]
    fn test_persist_output_overwrites() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.json");
        fs::write(&path, "stale contents").unwrap();

        persist_output(&path, &json!({"answer": 42})).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\n  \"answer\": 42\n"));
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, json!({"answer": 42}));

        // No temp files left behind next to the output.
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_task_numbers_survive_read_and_persist() {
        let temp = TempDir::new().unwrap();
        let task = temp.path().join("task.json");
        let output = temp.path().join("output.json");
        fs::write(&task, r#"{"a": 123456789012345678901234567890, "f": 0.30000000000000004}"#).unwrap();

        let input = read_task_input(&task).unwrap();
        assert_eq!(
            serde_json::to_string(&input).unwrap(),
            r#"{"a":123456789012345678901234567890,"f":0.30000000000000004}"#
        );

        persist_output(&output, &input).unwrap();
        let written = fs::read_to_string(&output).unwrap();
        assert!(written.contains("\"a\": 123456789012345678901234567890"));
        assert!(written.contains("\"f\": 0.30000000000000004"));
    }

    #[test]
    fn test_persist_output_missing_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing").join("output.json");
        let err = persist_output(&path, &json!(1)).unwrap_err();
        assert_eq!(err.kind(), "persist_error");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_run_with_empty_reference_is_no_result() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("output.json");
        let runner = AgentRunner::new(RunConfig::new());

        let outcome = runner
            .run("", &temp.path().join("task.json"), &output)
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind.as_deref(), Some("fetch_error"));
        assert!(!output.exists());
    }
}
