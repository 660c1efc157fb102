//! Untrusted agent pipeline.
//!
//! Fetches a peer-supplied repository, loads its entry point in a separate
//! process, feeds it the task input and persists what it returns.
//!
//! # Architecture
//!
//! ```text
//! reference → Fetcher → WorkingCopy → AgentLoader → AgentModule → run(task) → output.json
//! ```
//!
//! The runner:
//! 1. Clones the repository into a temporary working copy (bounded in time)
//! 2. Locates the entry point and starts the agent process
//! 3. Waits for the agent to confirm it exposes `run`
//! 4. Reads the task input and invokes `run` (bounded in time)
//! 5. Writes the result and removes the working copy
//!
//! # Example
//!
//! ```ignore
//! use agent_validator::runner::{AgentRunner, RunConfig};
//!
//! let config = RunConfig::new().with_exec_timeout(Duration::from_secs(60));
//! let runner = AgentRunner::new(config);
//!
//! let outcome = runner
//!     .run("https://github.com/org/agent", Path::new("task.json"), Path::new("output.json"))
//!     .await;
//!
//! if let Some(output) = outcome.output() {
//!     println!("{}", output);
//! }
//! ```

pub mod config;
pub mod executor;
pub mod fetcher;
pub mod loader;
pub mod result;
pub mod sandbox;

pub use config::RunConfig;
pub use executor::{persist_output, read_task_input, AgentRunner};
pub use fetcher::{Fetcher, WorkingCopy, WORKING_COPY_PREFIX};
pub use loader::{AgentLoader, AgentModule};
pub use result::{PipelineOutcome, PipelineStatus};
pub use sandbox::{IsolationMode, SandboxConfig};
