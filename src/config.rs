//! Validator configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `VALIDATOR_*` environment variables. The CLI applies its flags last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reward::{RewardMode, Scorer, DEFAULT_REWARD_PREFIX};
use crate::runner::config::{DEFAULT_ENTRY_POINT, DEFAULT_INTERPRETER};
use crate::runner::{IsolationMode, RunConfig, SandboxConfig};

/// Isolation backend selector as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    #[default]
    Local,
    Docker,
}

/// Configuration for the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    // Fetch settings
    /// Clone timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Extra clone attempts after a failure.
    pub fetch_retries: u32,
    /// Delay between clone attempts in seconds.
    pub fetch_retry_delay_secs: u64,
    /// Shallow clone depth.
    pub clone_depth: Option<u32>,
    /// Parent directory for working copies.
    pub workdir_root: Option<PathBuf>,

    // Agent settings
    /// Entry point path relative to the repository root.
    pub entry_point: PathBuf,
    /// Interpreter hosting the agent.
    pub interpreter: String,
    /// Time allowed for the agent to load, in seconds.
    pub load_timeout_secs: u64,
    /// Time allowed for `run`, in seconds.
    pub exec_timeout_secs: u64,
    /// Extra environment variables for the agent process (besides `PATH`).
    pub env_vars: BTreeMap<String, String>,

    // Isolation settings
    /// Isolation backend.
    pub isolation: IsolationKind,
    /// Docker image (docker isolation only).
    pub docker_image: String,
    /// Container memory limit in MB.
    pub memory_limit_mb: u64,
    /// Container CPU limit in cores.
    pub cpu_limit: f64,
    /// Whether containers get network access.
    pub network: bool,

    // Task I/O
    /// Task input file.
    pub task_path: PathBuf,
    /// Task output file.
    pub output_path: PathBuf,

    // Cycle settings
    /// Maximum pipelines running at once.
    pub max_concurrent_pipelines: usize,
    /// Minimum pause between cycles in seconds.
    pub cycle_interval_secs: u64,

    // Reward settings
    /// Prefix a reference needs for a reward.
    pub reward_prefix: String,
    /// Which signal decides the reward.
    pub reward_mode: RewardMode,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            fetch_retries: 0,
            fetch_retry_delay_secs: 2,
            clone_depth: None,
            workdir_root: None,

            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            load_timeout_secs: 60,
            exec_timeout_secs: 60,
            env_vars: BTreeMap::new(),

            isolation: IsolationKind::Local,
            docker_image: "python:3.11-slim".to_string(),
            memory_limit_mb: 1024,
            cpu_limit: 1.0,
            network: false,

            task_path: PathBuf::from("task.json"),
            output_path: PathBuf::from("output.json"),

            max_concurrent_pipelines: 4,
            cycle_interval_secs: 5,

            reward_prefix: DEFAULT_REWARD_PREFIX.to_string(),
            reward_mode: RewardMode::ReferenceSyntax,
        }
    }
}

impl ValidatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file (missing keys keep defaults).
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads defaults, the optional file, and environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `VALIDATOR_FETCH_TIMEOUT_SECS`, `VALIDATOR_FETCH_RETRIES`
    /// - `VALIDATOR_LOAD_TIMEOUT_SECS`, `VALIDATOR_EXEC_TIMEOUT_SECS`
    /// - `VALIDATOR_ENTRY_POINT`, `VALIDATOR_INTERPRETER`
    /// - `VALIDATOR_AGENT_ENV` (`KEY=value,KEY2=value2`, merged into `env_vars`)
    /// - `VALIDATOR_ISOLATION` (`local` or `docker`), `VALIDATOR_DOCKER_IMAGE`
    /// - `VALIDATOR_TASK_PATH`, `VALIDATOR_OUTPUT_PATH`, `VALIDATOR_WORKDIR_ROOT`
    /// - `VALIDATOR_MAX_CONCURRENT_PIPELINES`, `VALIDATOR_CYCLE_INTERVAL_SECS`
    /// - `VALIDATOR_REWARD_PREFIX`, `VALIDATOR_REWARD_MODE`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = get("VALIDATOR_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_env_value(&val, "VALIDATOR_FETCH_TIMEOUT_SECS")?;
        }
        if let Some(val) = get("VALIDATOR_FETCH_RETRIES") {
            self.fetch_retries = parse_env_value(&val, "VALIDATOR_FETCH_RETRIES")?;
        }
        if let Some(val) = get("VALIDATOR_LOAD_TIMEOUT_SECS") {
            self.load_timeout_secs = parse_env_value(&val, "VALIDATOR_LOAD_TIMEOUT_SECS")?;
        }
        if let Some(val) = get("VALIDATOR_EXEC_TIMEOUT_SECS") {
            self.exec_timeout_secs = parse_env_value(&val, "VALIDATOR_EXEC_TIMEOUT_SECS")?;
        }
        if let Some(val) = get("VALIDATOR_ENTRY_POINT") {
            self.entry_point = PathBuf::from(val);
        }
        if let Some(val) = get("VALIDATOR_INTERPRETER") {
            self.interpreter = val;
        }
        if let Some(val) = get("VALIDATOR_AGENT_ENV") {
            for pair in val.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                    key: "VALIDATOR_AGENT_ENV".to_string(),
                    message: format!("expected KEY=value, got '{}'", pair),
                })?;
                self.env_vars.insert(key.trim().to_string(), value.to_string());
            }
        }
        if let Some(val) = get("VALIDATOR_ISOLATION") {
            self.isolation = match val.to_lowercase().as_str() {
                "local" => IsolationKind::Local,
                "docker" => IsolationKind::Docker,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "VALIDATOR_ISOLATION".to_string(),
                        message: format!("expected 'local' or 'docker', got '{}'", val),
                    })
                }
            };
        }
        if let Some(val) = get("VALIDATOR_DOCKER_IMAGE") {
            self.docker_image = val;
        }
        if let Some(val) = get("VALIDATOR_TASK_PATH") {
            self.task_path = PathBuf::from(val);
        }
        if let Some(val) = get("VALIDATOR_OUTPUT_PATH") {
            self.output_path = PathBuf::from(val);
        }
        if let Some(val) = get("VALIDATOR_WORKDIR_ROOT") {
            self.workdir_root = Some(PathBuf::from(val));
        }
        if let Some(val) = get("VALIDATOR_MAX_CONCURRENT_PIPELINES") {
            self.max_concurrent_pipelines =
                parse_env_value(&val, "VALIDATOR_MAX_CONCURRENT_PIPELINES")?;
        }
        if let Some(val) = get("VALIDATOR_CYCLE_INTERVAL_SECS") {
            self.cycle_interval_secs = parse_env_value(&val, "VALIDATOR_CYCLE_INTERVAL_SECS")?;
        }
        if let Some(val) = get("VALIDATOR_REWARD_PREFIX") {
            self.reward_prefix = val;
        }
        if let Some(val) = get("VALIDATOR_REWARD_MODE") {
            self.reward_mode = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "VALIDATOR_REWARD_MODE".to_string(),
                message,
            })?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.load_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "load_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.exec_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "exec_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_pipelines == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_pipelines must be greater than 0".to_string(),
            ));
        }

        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "interpreter cannot be empty".to_string(),
            ));
        }

        if !self.run_config().entry_point_is_contained() {
            return Err(ConfigError::ValidationFailed(format!(
                "entry_point '{}' must be a relative path inside the repository",
                self.entry_point.display()
            )));
        }

        if let Some(key) = self
            .env_vars
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "invalid agent environment variable name '{}'",
                key
            )));
        }

        if self.reward_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "reward_prefix cannot be empty".to_string(),
            ));
        }

        if self.isolation == IsolationKind::Docker {
            if self.docker_image.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "docker_image cannot be empty".to_string(),
                ));
            }
            if self.memory_limit_mb < 64 {
                return Err(ConfigError::ValidationFailed(
                    "memory_limit_mb must be at least 64 MB".to_string(),
                ));
            }
            if self.cpu_limit < 0.0 {
                return Err(ConfigError::ValidationFailed(
                    "cpu_limit cannot be negative".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Builds the per-pipeline run configuration.
    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new()
            .with_fetch_timeout(Duration::from_secs(self.fetch_timeout_secs))
            .with_fetch_retries(self.fetch_retries)
            .with_fetch_retry_delay(Duration::from_secs(self.fetch_retry_delay_secs))
            .with_entry_point(self.entry_point.clone())
            .with_interpreter(self.interpreter.clone())
            .with_load_timeout(Duration::from_secs(self.load_timeout_secs))
            .with_exec_timeout(Duration::from_secs(self.exec_timeout_secs))
            .with_isolation(self.isolation_mode());

        if let Some(depth) = self.clone_depth {
            config = config.with_clone_depth(depth);
        }
        if let Some(root) = &self.workdir_root {
            config = config.with_workdir_root(root.clone());
        }
        for (key, value) in &self.env_vars {
            config = config.with_env(key.clone(), value.clone());
        }
        config
    }

    /// Builds the isolation mode.
    pub fn isolation_mode(&self) -> IsolationMode {
        match self.isolation {
            IsolationKind::Local => IsolationMode::Local,
            IsolationKind::Docker => IsolationMode::Docker(
                SandboxConfig::new(self.docker_image.clone())
                    .with_memory_mb(self.memory_limit_mb)
                    .with_cpu_limit(self.cpu_limit)
                    .with_network(self.network),
            ),
        }
    }

    /// Builds the scorer.
    pub fn scorer(&self) -> Scorer {
        Scorer::new(self.reward_prefix.clone(), self.reward_mode)
    }

    /// Minimum pause between cycles.
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ValidatorConfig::default();
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.exec_timeout_secs, 60);
        assert_eq!(config.cycle_interval(), Duration::from_secs(5));
        assert_eq!(config.task_path, PathBuf::from("task.json"));
        assert_eq!(config.output_path, PathBuf::from("output.json"));
        assert_eq!(config.reward_prefix, "https://github.com");
        assert_eq!(config.reward_mode, RewardMode::ReferenceSyntax);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = "exec_timeout_secs: 5\nisolation: docker\nreward_mode: execution_outcome\n";
        let config = ValidatorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.exec_timeout_secs, 5);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.isolation, IsolationKind::Docker);
        assert_eq!(config.reward_mode, RewardMode::ExecutionOutcome);
        assert!(matches!(config.isolation_mode(), IsolationMode::Docker(_)));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = ValidatorConfig::from_yaml_str("  \n").unwrap();
        assert_eq!(config.exec_timeout_secs, 60);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = ValidatorConfig::from_yaml_str("exec_timeout_secs: [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ValidatorConfig::from_yaml_file(Path::new("/nonexistent/validator.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ValidatorConfig::default();
        config
            .apply_vars(vars(&[
                ("VALIDATOR_EXEC_TIMEOUT_SECS", "7"),
                ("VALIDATOR_ISOLATION", "docker"),
                ("VALIDATOR_REWARD_MODE", "execution-outcome"),
                ("VALIDATOR_OUTPUT_PATH", "/tmp/out.json"),
            ]))
            .unwrap();

        assert_eq!(config.exec_timeout_secs, 7);
        assert_eq!(config.isolation, IsolationKind::Docker);
        assert_eq!(config.reward_mode, RewardMode::ExecutionOutcome);
        assert_eq!(config.output_path, PathBuf::from("/tmp/out.json"));
    }

    #[test]
    fn test_agent_env_vars_reach_run_config() {
        let yaml = "env_vars:\n  OPENAI_API_KEY: sk-test\n  MODE: eval\n";
        let mut config = ValidatorConfig::from_yaml_str(yaml).unwrap();
        config
            .apply_vars(vars(&[("VALIDATOR_AGENT_ENV", "MODE=strict, SEED=7")]))
            .unwrap();
        assert!(config.validate().is_ok());

        let run = config.run_config();
        assert_eq!(
            run.env_vars,
            vec![
                ("MODE".to_string(), "strict".to_string()),
                ("OPENAI_API_KEY".to_string(), "sk-test".to_string()),
                ("SEED".to_string(), "7".to_string()),
            ]
        );
    }

    #[test]
    fn test_agent_env_rejects_bad_entries() {
        let mut config = ValidatorConfig::default();
        assert!(config
            .apply_vars(vars(&[("VALIDATOR_AGENT_ENV", "NOVALUE")]))
            .is_err());

        config.env_vars.insert(String::new(), "x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = ValidatorConfig::default();
        let err = config
            .apply_vars(vars(&[("VALIDATOR_FETCH_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("VALIDATOR_FETCH_TIMEOUT_SECS"));

        let err = config
            .apply_vars(vars(&[("VALIDATOR_ISOLATION", "vm")]))
            .unwrap_err();
        assert!(err.to_string().contains("VALIDATOR_ISOLATION"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ValidatorConfig::default();
        config.exec_timeout_secs = 0;
        assert!(config.validate().unwrap_err().to_string().contains("exec_timeout_secs"));

        let mut config = ValidatorConfig::default();
        config.max_concurrent_pipelines = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_pipelines"));

        let mut config = ValidatorConfig::default();
        config.entry_point = PathBuf::from("../escape.py");
        assert!(config.validate().unwrap_err().to_string().contains("entry_point"));

        let mut config = ValidatorConfig::default();
        config.reward_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_config_mapping() {
        let mut config = ValidatorConfig::default();
        config.fetch_timeout_secs = 3;
        config.exec_timeout_secs = 4;
        config.clone_depth = Some(1);

        let run = config.run_config();
        assert_eq!(run.fetch_timeout, Duration::from_secs(3));
        assert_eq!(run.exec_timeout, Duration::from_secs(4));
        assert_eq!(run.clone_depth, Some(1));
        assert!(matches!(run.isolation, IsolationMode::Local));
    }
}
