//! Repository fetching into ephemeral working copies.
//!
//! A [`WorkingCopy`] owns its temporary directory: dropping it removes the
//! directory, so every exit path of a pipeline (success, error, timeout,
//! panic unwinding) reclaims the clone.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::config::RunConfig;
use crate::error::FetchError;

/// Prefix of every working copy directory name.
pub const WORKING_COPY_PREFIX: &str = "agent-wc-";

/// A locally cloned repository, deleted when dropped.
#[derive(Debug)]
pub struct WorkingCopy {
    dir: TempDir,
    reference: String,
}

impl WorkingCopy {
    /// Returns the root of the working copy.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the reference this working copy was cloned from.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Removes the working copy now, reporting any removal error.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// Clones repositories with a hard time bound.
#[derive(Debug, Clone)]
pub struct Fetcher {
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    depth: Option<u32>,
    root: Option<PathBuf>,
}

impl Fetcher {
    /// Creates a fetcher with the given clone timeout and no retries.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 0,
            retry_delay: Duration::from_secs(2),
            depth: None,
            root: None,
        }
    }

    /// Creates a fetcher from a run configuration.
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            timeout: config.fetch_timeout,
            retries: config.fetch_retries,
            retry_delay: config.fetch_retry_delay,
            depth: config.clone_depth,
            root: config.workdir_root.clone(),
        }
    }

    /// Sets the number of extra attempts after a failed clone.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    /// Sets the parent directory for working copies.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Clones `reference` into a fresh working copy.
    ///
    /// Retries up to the configured count; each attempt gets its own
    /// directory and its own time allowance.
    pub async fn fetch(&self, reference: &str) -> Result<WorkingCopy, FetchError> {
        if reference.trim().is_empty() {
            return Err(FetchError::EmptyReference);
        }

        let mut attempt = 0;
        loop {
            match self.clone_once(reference).await {
                Ok(copy) => return Ok(copy),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        reference = %reference,
                        attempt,
                        max_retries = self.retries,
                        error = %e,
                        "Clone failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn clone_once(&self, reference: &str) -> Result<WorkingCopy, FetchError> {
        let dir = self.create_dir()?;
        let start = Instant::now();
        debug!(reference = %reference, dir = %dir.path().display(), "Cloning repository");

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--quiet");
        if let Some(depth) = self.depth {
            cmd.arg("--depth").arg(depth.to_string());
        }
        cmd.arg("--")
            .arg(reference)
            .arg(dir.path())
            // Fail instead of prompting for credentials.
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(FetchError::Spawn)?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!(
                    reference = %reference,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Repository cloned"
                );
                Ok(WorkingCopy {
                    dir,
                    reference: reference.to_string(),
                })
            }
            Ok(Ok(status)) => Err(FetchError::CloneFailed {
                exit_code: status.code(),
            }),
            Ok(Err(e)) => Err(FetchError::Spawn(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(reference = %reference, error = %e, "Failed to kill clone process");
                }
                Err(FetchError::Timeout(self.timeout))
            }
        }
    }

    fn create_dir(&self) -> Result<TempDir, FetchError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKING_COPY_PREFIX);
        match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(FetchError::WorkingCopy)
    }
}
