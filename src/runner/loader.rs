//! Agent loading and invocation across a process boundary.
//!
//! The entry point is never imported into the validator. Instead a small
//! harness is started in a child process: it imports the entry point under a
//! fresh module namespace, checks for a callable `run`, and then speaks a
//! line-delimited JSON protocol over stdio:
//!
//! ```text
//! child -> host   {"event":"ready"}
//!                 {"event":"load_error","message":"..."}
//!                 {"event":"missing_capability","message":"..."}
//! host  -> child  <task input JSON>
//! child -> host   {"event":"result","output":...}
//!                 {"event":"run_error","message":"..."}
//! ```
//!
//! The agent's own writes to stdout are redirected to stderr inside the
//! harness; stderr is forwarded to `tracing` at debug level.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::config::{is_contained, RunConfig};
use super::fetcher::WorkingCopy;
use super::sandbox::IsolationMode;
use crate::error::PipelineError;

/// How long a finished agent process gets to exit on its own.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Harness executed by the interpreter; `sys.argv[1]` is the entry point.
pub const HARNESS: &str = r#"import importlib.util
import inspect
import json
import os
import sys

_protocol = sys.stdout
sys.stdout = sys.stderr


def _emit(event, **fields):
    fields["event"] = event
    line = json.dumps(fields, allow_nan=False)
    _protocol.write(line + "\n")
    _protocol.flush()


def _describe(exc):
    return "%s: %s" % (type(exc).__name__, exc)


def main(path):
    sys.path.insert(0, os.path.dirname(os.path.abspath(path)))
    try:
        spec = importlib.util.spec_from_file_location("agent", path)
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
    except BaseException as exc:
        _emit("load_error", message=_describe(exc))
        return 3
    run = getattr(module, "run", None)
    if run is None or not callable(run):
        _emit("missing_capability", message="module has no callable `run`")
        return 4
    try:
        inspect.signature(run).bind(None)
    except TypeError as exc:
        _emit("missing_capability", message="`run` cannot take one argument: %s" % exc)
        return 4
    except ValueError:
        pass
    _emit("ready")
    line = sys.stdin.readline()
    if not line:
        return 0
    try:
        task = json.loads(line)
    except ValueError as exc:
        _emit("run_error", message="invalid task input: " + _describe(exc))
        return 5
    try:
        output = run(task)
    except BaseException as exc:
        _emit("run_error", message=_describe(exc))
        return 5
    try:
        _emit("result", output=output)
    except (TypeError, ValueError) as exc:
        _emit("run_error", message="output is not JSON serializable: " + _describe(exc))
        return 5
    return 0


sys.exit(main(sys.argv[1]))
"#;

/// Messages emitted by the harness.
#[derive(Debug)]
enum HarnessEvent {
    Ready,
    LoadError { message: String },
    MissingCapability { message: String },
    Output { output: Value },
    RunError { message: String },
}

impl HarnessEvent {
    /// Parses one protocol line; `None` for anything that is not an event.
    ///
    /// The line goes straight into a `Value` so numbers keep the exact text
    /// the agent produced.
    fn parse(line: &str) -> Option<Self> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(line).ok()? else {
            return None;
        };
        let kind = fields.get("event")?.as_str()?.to_string();
        let message = fields.get("message").and_then(Value::as_str).map(str::to_string);
        let event = match kind.as_str() {
            "ready" => HarnessEvent::Ready,
            "load_error" => HarnessEvent::LoadError { message: message? },
            "missing_capability" => HarnessEvent::MissingCapability { message: message? },
            "run_error" => HarnessEvent::RunError { message: message? },
            "result" => HarnessEvent::Output {
                output: fields.remove("output")?,
            },
            _ => return None,
        };
        Some(event)
    }
}

/// Locates and loads agent entry points.
#[derive(Debug, Clone)]
pub struct AgentLoader {
    entry_point: PathBuf,
    interpreter: String,
    isolation: IsolationMode,
    env_vars: Vec<(String, String)>,
    load_timeout: Duration,
    exec_timeout: Duration,
}

impl AgentLoader {
    /// Creates a loader from a run configuration.
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            entry_point: config.entry_point.clone(),
            interpreter: config.interpreter.clone(),
            isolation: config.isolation.clone(),
            env_vars: config.env_vars.clone(),
            load_timeout: config.load_timeout,
            exec_timeout: config.exec_timeout,
        }
    }

    /// Locates the entry point inside `copy` and loads it in a new process.
    ///
    /// Returns once the harness has imported the module and confirmed that
    /// it exposes `run`.
    pub async fn load(&self, copy: &WorkingCopy) -> Result<AgentModule, PipelineError> {
        if !is_contained(&self.entry_point) {
            warn!(entry = %self.entry_point.display(), "Entry point escapes the working copy");
            return Err(PipelineError::MissingEntryPoint(self.entry_point.clone()));
        }
        let entry = copy.path().join(&self.entry_point);
        if !entry.is_file() {
            return Err(PipelineError::MissingEntryPoint(self.entry_point.clone()));
        }
        debug!(reference = %copy.reference(), entry = %entry.display(), "Entry point located");

        let command = self.isolation.agent_command(
            &self.interpreter,
            HARNESS,
            copy.path(),
            &self.entry_point,
            &self.env_vars,
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.current_dir)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so anything the agent starts can be killed with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::Load(format!("failed to spawn {}: {}", command.program, e))
        })?;
        let process_group = child.id();

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, copy.reference().to_string());
        }

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(PipelineError::Load("agent process has no stdio".to_string())),
        };

        let mut module = AgentModule {
            child,
            process_group,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            container: command.container,
            entry_point: self.entry_point.clone(),
            exec_timeout: self.exec_timeout,
            finished: false,
        };

        let event = tokio::time::timeout(self.load_timeout, module.next_event()).await;
        let failure = match event {
            Ok(Ok(Some(HarnessEvent::Ready))) => {
                info!(reference = %copy.reference(), "Agent loaded");
                return Ok(module);
            }
            Ok(Ok(Some(HarnessEvent::LoadError { message }))) => PipelineError::Load(message),
            Ok(Ok(Some(HarnessEvent::MissingCapability { message }))) => {
                PipelineError::MissingCapability(message)
            }
            Ok(Ok(Some(other))) => {
                PipelineError::Load(format!("unexpected harness event before ready: {:?}", other))
            }
            Ok(Ok(None)) => {
                let status = module.exit_status().await;
                PipelineError::Load(format!("agent process exited before loading ({})", status))
            }
            Ok(Err(e)) => PipelineError::Load(format!("failed to read from agent: {}", e)),
            Err(_) => PipelineError::Load(format!("timed out after {:?}", self.load_timeout)),
        };

        module.terminate().await;
        Err(failure)
    }
}

/// A loaded agent: a live process whose entry point exposes `run`.
///
/// Single use. [`AgentModule::run`] consumes the module and always reaps the
/// process before returning.
pub struct AgentModule {
    child: Child,
    process_group: Option<u32>,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    container: Option<String>,
    entry_point: PathBuf,
    exec_timeout: Duration,
    finished: bool,
}

impl std::fmt::Debug for AgentModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentModule")
            .field("pid", &self.child.id())
            .field("container", &self.container)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

impl AgentModule {
    /// Invokes `run(input)` within the execution time allowance.
    pub async fn run(mut self, input: &Value) -> Result<Value, PipelineError> {
        let timeout = self.exec_timeout;
        let outcome = tokio::time::timeout(timeout, self.exchange(input)).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(entry = %self.entry_point.display(), "Agent timed out, killing");
                self.terminate().await;
                return Err(PipelineError::ExecutionTimeout(timeout));
            }
        };

        if result.is_ok() {
            // Give the harness a moment to exit cleanly before forcing it.
            if tokio::time::timeout(EXIT_GRACE, self.child.wait()).await.is_err() {
                debug!("Agent did not exit after responding");
            }
        }
        self.terminate().await;
        result
    }

    async fn exchange(&mut self, input: &Value) -> Result<Value, PipelineError> {
        let mut line = serde_json::to_string(input)
            .map_err(|e| PipelineError::Execution(format!("failed to encode task input: {}", e)))?;
        line.push('\n');

        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| PipelineError::Execution(format!("failed to send task input: {}", e)))?;
            stdin.shutdown().await.ok();
        }

        match self.next_event().await {
            Ok(Some(HarnessEvent::Output { output })) => Ok(output),
            Ok(Some(HarnessEvent::RunError { message })) => Err(PipelineError::Execution(message)),
            Ok(Some(other)) => Err(PipelineError::Execution(format!(
                "unexpected harness event: {:?}",
                other
            ))),
            Ok(None) => {
                let status = self.exit_status().await;
                Err(PipelineError::Execution(format!(
                    "agent process exited without a result ({})",
                    status
                )))
            }
            Err(e) => Err(PipelineError::Execution(format!(
                "failed to read from agent: {}",
                e
            ))),
        }
    }

    /// Reads protocol lines until one parses as a harness event.
    async fn next_event(&mut self) -> std::io::Result<Option<HarnessEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            match HarnessEvent::parse(&line) {
                Some(event) => return Ok(Some(event)),
                None => debug!(line = %truncate(&line, 200), "Ignoring non-protocol output"),
            }
        }
        Ok(None)
    }

    async fn exit_status(&mut self) -> String {
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => "still running".to_string(),
        }
    }

    /// Kills the process group (and container) and reaps the agent.
    async fn terminate(&mut self) {
        if self.finished {
            return;
        }
        kill_process_group(self.process_group);
        self.child.start_kill().ok();
        if let Err(e) = self.child.wait().await {
            warn!(error = %e, "Failed to reap agent process");
        }
        if let Some(name) = &self.container {
            let _ = Command::new("docker")
                .args(["kill", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        self.finished = true;
    }
}

impl Drop for AgentModule {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // kill_on_drop only reaches the direct child.
        kill_process_group(self.process_group);
        if let Some(name) = &self.container {
            let _ = std::process::Command::new("docker")
                .args(["kill", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

/// Sends SIGKILL to every process in the agent's group.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "Failed to kill agent process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_: Option<u32>) {}

/// Forwards agent stderr to the log without touching the host's streams.
fn forward_stderr(stderr: tokio::process::ChildStderr, reference: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "agent", reference = %reference, "{}", line);
        }
    });
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_harness_events() {
        assert!(matches!(HarnessEvent::parse(r#"{"event":"ready"}"#), Some(HarnessEvent::Ready)));

        match HarnessEvent::parse(r#"{"output":{"a":1},"event":"result"}"#) {
            Some(HarnessEvent::Output { output }) => assert_eq!(output, serde_json::json!({"a": 1})),
            other => panic!("expected Output, got {:?}", other),
        }

        let missing = HarnessEvent::parse(r#"{"event":"missing_capability","message":"no run"}"#);
        assert!(matches!(missing, Some(HarnessEvent::MissingCapability { ref message }) if message == "no run"));
    }

    #[test]
    fn test_result_event_with_null_output() {
        let event = HarnessEvent::parse(r#"{"event":"result","output":null}"#);
        assert!(matches!(event, Some(HarnessEvent::Output { output: Value::Null })));
    }

    #[test]
    fn test_result_keeps_exact_numbers() {
        let line = r#"{"event":"result","output":{"big":123456789012345678901234567890,"f":0.30000000000000004}}"#;
        let Some(HarnessEvent::Output { output }) = HarnessEvent::parse(line) else {
            panic!("expected Output");
        };
        assert_eq!(output["big"].to_string(), "123456789012345678901234567890");
        assert_eq!(output["f"].to_string(), "0.30000000000000004");
    }

    #[test]
    fn test_non_protocol_lines_rejected() {
        assert!(HarnessEvent::parse("hello world").is_none());
        assert!(HarnessEvent::parse(r#"{"event":"unknown"}"#).is_none());
        assert!(HarnessEvent::parse(r#"{"event":"load_error"}"#).is_none());
        assert!(HarnessEvent::parse(r#"[1,2,3]"#).is_none());
    }

    #[test]
    fn test_harness_reads_entry_point_from_argv() {
        assert!(HARNESS.contains("sys.argv[1]"));
        assert!(HARNESS.starts_with("import "));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
