//! Process isolation for agent execution.
//!
//! The agent always runs in a separate process. `Local` spawns the
//! interpreter directly on the host with a scrubbed environment; `Docker`
//! wraps the same invocation in a throwaway container with resource limits
//! and the working copy mounted read-only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mount point of the working copy inside the container.
const CONTAINER_WORKDIR: &str = "/agent";

/// How the agent process is isolated from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Child process on the host.
    Local,
    /// Child process inside a Docker container.
    Docker(SandboxConfig),
}

impl Default for IsolationMode {
    fn default() -> Self {
        Self::Local
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Local => write!(f, "local"),
            IsolationMode::Docker(config) => write!(f, "docker({})", config.image),
        }
    }
}

/// Configuration for the container sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Docker image to use.
    pub image: String,
    /// Memory limit in bytes.
    pub memory_limit: u64,
    /// CPU limit (number of cores, 0 for no limit).
    pub cpu_limit: f64,
    /// Whether the container gets network access.
    pub network: bool,
}

impl SandboxConfig {
    /// Creates a new sandbox configuration with defaults.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            memory_limit: 1024 * 1024 * 1024, // 1GB
            cpu_limit: 1.0,
            network: false,
        }
    }

    /// Sets the memory limit in MB.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit = mb * 1024 * 1024;
        self
    }

    /// Sets the CPU limit.
    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_limit = cores;
        self
    }

    /// Enables or disables network access.
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network = enabled;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new("python:3.11-slim")
    }
}

/// A fully resolved command line for the agent host process.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory for the spawned process.
    pub current_dir: PathBuf,
    /// Environment passed to the spawned process (the rest is cleared).
    pub env: Vec<(String, String)>,
    /// Name of the container, if the agent runs in one.
    pub container: Option<String>,
}

impl IsolationMode {
    /// Builds the command that hosts `script` for the entry point at
    /// `entry_point` (relative to `working_copy`).
    pub fn agent_command(
        &self,
        interpreter: &str,
        script: &str,
        working_copy: &Path,
        entry_point: &Path,
        env_vars: &[(String, String)],
    ) -> AgentCommand {
        let mut env = inherited_path();

        match self {
            IsolationMode::Local => {
                env.extend(env_vars.iter().cloned());
                AgentCommand {
                    program: interpreter.to_string(),
                    args: vec![
                        "-u".to_string(),
                        "-c".to_string(),
                        script.to_string(),
                        working_copy.join(entry_point).to_string_lossy().to_string(),
                    ],
                    current_dir: working_copy.to_path_buf(),
                    env,
                    container: None,
                }
            }
            IsolationMode::Docker(config) => {
                let name = format!("agent-validator-{}", Uuid::new_v4());
                let mut args = docker_run_args(config, &name, working_copy, env_vars);
                let container_entry = Path::new(CONTAINER_WORKDIR).join(entry_point);
                args.extend([
                    interpreter.to_string(),
                    "-u".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    container_entry.to_string_lossy().to_string(),
                ]);
                AgentCommand {
                    program: "docker".to_string(),
                    args,
                    current_dir: working_copy.to_path_buf(),
                    env,
                    container: Some(name),
                }
            }
        }
    }
}

/// Builds the `docker run` prefix (everything up to and including the image).
fn docker_run_args(
    config: &SandboxConfig,
    name: &str,
    working_copy: &Path,
    env_vars: &[(String, String)],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    // Resource limits
    let gb = config.memory_limit / (1024 * 1024 * 1024);
    if gb > 0 && config.memory_limit % (1024 * 1024 * 1024) == 0 {
        args.push(format!("--memory={}g", gb));
    } else {
        args.push(format!("--memory={}m", config.memory_limit / (1024 * 1024)));
    }
    if config.cpu_limit > 0.0 {
        args.push(format!("--cpus={}", config.cpu_limit));
    }
    if !config.network {
        args.push("--network=none".to_string());
    }

    args.extend([
        "-v".to_string(),
        format!("{}:{}:ro", working_copy.display(), CONTAINER_WORKDIR),
        "-w".to_string(),
        CONTAINER_WORKDIR.to_string(),
    ]);

    for (key, value) in env_vars {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(config.image.clone());
    args
}

/// The only host variable the agent process inherits.
fn inherited_path() -> Vec<(String, String)> {
    std::env::var("PATH")
        .map(|path| vec![("PATH".to_string(), path)])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.cpu_limit, 1.0);
        assert!(!config.network);
    }

    #[test]
    fn test_local_command() {
        let cmd = IsolationMode::Local.agent_command(
            "python3",
            "print(1)",
            Path::new("/tmp/wc"),
            Path::new("agent.py"),
            &[("K".to_string(), "V".to_string())],
        );

        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args[0], "-u");
        assert_eq!(cmd.args[1], "-c");
        assert_eq!(cmd.args[3], "/tmp/wc/agent.py");
        assert_eq!(cmd.current_dir, PathBuf::from("/tmp/wc"));
        assert!(cmd.env.iter().any(|(k, v)| k == "K" && v == "V"));
        assert!(cmd.container.is_none());
    }

    #[test]
    fn test_docker_command() {
        let config = SandboxConfig::new("test:latest")
            .with_memory_mb(512)
            .with_cpu_limit(0.5);
        let cmd = IsolationMode::Docker(config).agent_command(
            "python3",
            "print(1)",
            Path::new("/tmp/wc"),
            Path::new("agent.py"),
            &[],
        );

        assert_eq!(cmd.program, "docker");
        assert!(cmd.args.contains(&"--rm".to_string()));
        assert!(cmd.args.contains(&"-i".to_string()));
        assert!(cmd.args.contains(&"--memory=512m".to_string()));
        assert!(cmd.args.contains(&"--cpus=0.5".to_string()));
        assert!(cmd.args.contains(&"--network=none".to_string()));
        assert!(cmd.args.contains(&"/tmp/wc:/agent:ro".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("/agent/agent.py"));

        let name = cmd.container.expect("docker runs are named");
        assert!(cmd.args.contains(&name));
    }

    #[test]
    fn test_docker_network_and_memory_rounding() {
        let config = SandboxConfig::new("img").with_memory_mb(2048).with_network(true);
        let args = docker_run_args(&config, "n", Path::new("/wc"), &[]);
        assert!(args.contains(&"--memory=2g".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--network")));
    }
}
