//! Configuration for a single pipeline run.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sandbox::IsolationMode;

/// Default relative path of the agent entry point inside a working copy.
pub const DEFAULT_ENTRY_POINT: &str = "agent.py";

/// Default interpreter used to host the agent process.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Configuration for fetching, loading and executing one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum time allowed for the repository clone.
    pub fetch_timeout: Duration,
    /// Extra clone attempts after a failed fetch (0 disables retry).
    pub fetch_retries: u32,
    /// Delay between clone attempts.
    pub fetch_retry_delay: Duration,
    /// Clone depth (`None` for a full clone).
    pub clone_depth: Option<u32>,
    /// Parent directory for working copies (`None` uses the OS temp dir).
    pub workdir_root: Option<PathBuf>,
    /// Entry point path, relative to the working copy root.
    pub entry_point: PathBuf,
    /// Interpreter used to host the agent.
    pub interpreter: String,
    /// Maximum time for the agent process to report a loaded module.
    pub load_timeout: Duration,
    /// Maximum time for `run` to return.
    pub exec_timeout: Duration,
    /// How the agent process is isolated from the host.
    pub isolation: IsolationMode,
    /// Environment variables passed to the agent process.
    pub env_vars: Vec<(String, String)>,
}

impl RunConfig {
    /// Creates a run configuration with defaults.
    pub fn new() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            fetch_retries: 0,
            fetch_retry_delay: Duration::from_secs(2),
            clone_depth: None,
            workdir_root: None,
            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            load_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(60),
            isolation: IsolationMode::Local,
            env_vars: Vec::new(),
        }
    }

    /// Sets the clone timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the number of extra clone attempts.
    pub fn with_fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = retries;
        self
    }

    /// Sets the delay between clone attempts.
    pub fn with_fetch_retry_delay(mut self, delay: Duration) -> Self {
        self.fetch_retry_delay = delay;
        self
    }

    /// Requests a shallow clone.
    pub fn with_clone_depth(mut self, depth: u32) -> Self {
        self.clone_depth = Some(depth);
        self
    }

    /// Sets the parent directory for working copies.
    pub fn with_workdir_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workdir_root = Some(root.into());
        self
    }

    /// Sets the entry point path.
    pub fn with_entry_point(mut self, entry_point: impl Into<PathBuf>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Sets the interpreter.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Sets the load timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Sets the execution timeout.
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    /// Sets the isolation mode.
    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    /// Adds an environment variable for the agent process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Returns true if the entry point stays inside the working copy.
    pub fn entry_point_is_contained(&self) -> bool {
        is_contained(&self.entry_point)
    }
}

/// True for a non-empty relative path made of plain components only.
pub fn is_contained(path: &Path) -> bool {
    let mut components = path.components().peekable();
    if components.peek().is_none() {
        return false;
    }
    components.all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new()
    }
}
