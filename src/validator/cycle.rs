//! The validator loop: query peers, run their agents, score, repeat.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use super::peers::{check_unique_uids, Candidate, PeerSource, RewardSink};
use crate::config::ValidatorConfig;
use crate::error::{PipelineError, ValidatorError};
use crate::reward::{PeerResponse, Scorer};
use crate::runner::{AgentRunner, PipelineOutcome};

/// Summary of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When rewards were handed to the sink.
    pub finished_at: DateTime<Utc>,
    /// Peer identifiers, in query order.
    pub uids: Vec<u16>,
    /// Rewards aligned with `uids`.
    pub rewards: Vec<f32>,
    /// Pipeline outcomes aligned with `uids` (`None` when nothing was run).
    pub outcomes: Vec<Option<PipelineOutcome>>,
}

impl CycleReport {
    /// Number of pipelines that were started.
    pub fn executed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_some()).count()
    }

    /// Number of pipelines that produced output.
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.as_ref().map(|o| o.is_success()).unwrap_or(false))
            .count()
    }
}

/// Drives reward cycles against a peer source and a reward sink.
pub struct Validator {
    config: ValidatorConfig,
    runner: Arc<AgentRunner>,
    scorer: Scorer,
    peers: Box<dyn PeerSource>,
    sink: Box<dyn RewardSink>,
}

impl Validator {
    /// Creates a validator.
    pub fn new(
        config: ValidatorConfig,
        peers: Box<dyn PeerSource>,
        sink: Box<dyn RewardSink>,
    ) -> Self {
        let runner = Arc::new(AgentRunner::new(config.run_config()));
        let scorer = config.scorer();
        Self {
            config,
            runner,
            scorer,
            peers,
            sink,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Runs one cycle.
    ///
    /// Every candidate with a reference gets its own pipeline; at most
    /// `max_concurrent_pipelines` run at once. Rewards are computed only after
    /// every pipeline has reached a terminal state.
    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport, ValidatorError> {
        let started_at = Utc::now();
        let candidates = self.peers.query().await?;
        check_unique_uids(&candidates)?;
        info!(cycle, count = candidates.len(), "Received responses");

        let outcomes = self.run_pipelines(&candidates).await;

        let responses: Vec<Option<PeerResponse>> =
            candidates.iter().map(|c| c.response.clone()).collect();
        let uids: Vec<u16> = candidates.iter().map(|c| c.uid).collect();
        let rewards = self.scorer.score_all(&responses, &outcomes);
        info!(cycle, ?uids, ?rewards, mode = ?self.scorer.mode(), "Scored rewards");

        self.sink.update_scores(&rewards, &uids).await?;

        Ok(CycleReport {
            cycle,
            started_at,
            finished_at: Utc::now(),
            uids,
            rewards,
            outcomes,
        })
    }

    async fn run_pipelines(&self, candidates: &[Candidate]) -> Vec<Option<PipelineOutcome>> {
        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_pipelines));
        let task_path = self.config.task_path.clone();

        let pipelines = candidates.iter().map(|candidate| {
            let reference = candidate.reference().map(str::to_string);
            let uid = candidate.uid;
            let runner = Arc::clone(&self.runner);
            let limiter = Arc::clone(&limiter);
            let task_path = task_path.clone();
            let output_path = output_path_for(&self.config.output_path, uid);

            async move {
                let Some(reference) = reference else {
                    info!(uid, "No agent reference, skipping");
                    return None;
                };

                let handle = {
                    let reference = reference.clone();
                    tokio::spawn(async move {
                        let _permit = limiter.acquire_owned().await.ok();
                        runner.run(&reference, &task_path, &output_path).await
                    })
                };

                let _abort = AbortOnDrop(handle.abort_handle());
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let error = PipelineError::Execution(format!("pipeline task aborted: {}", e));
                        warn!(uid, reference = %reference, error = %error, "Pipeline task did not finish");
                        PipelineOutcome::failure("aborted", &reference, &error, Utc::now(), Duration::ZERO)
                    }
                };

                if outcome.is_success() {
                    info!(uid, reference = %reference, "Successfully loaded agent");
                } else {
                    warn!(uid, reference = %reference, kind = ?outcome.error_kind, "Failed to load agent");
                }
                Some(outcome)
            }
        });

        join_all(pipelines).await
    }

    /// Runs cycles until Ctrl-C or until `max_cycles` have completed.
    ///
    /// A failed cycle (peer query or reward sink error) is logged and the
    /// loop moves on to the next one.
    pub async fn run_forever(&self, max_cycles: Option<u64>) -> Vec<CycleReport> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        self.run_until(max_cycles, ctrl_c).await
    }

    /// Runs cycles until `shutdown` resolves or `max_cycles` have completed.
    ///
    /// `shutdown` is watched during cycles as well as between them; a cycle
    /// interrupted by it is abandoned without scoring, and its pipelines are
    /// aborted.
    pub async fn run_until<F>(&self, max_cycles: Option<u64>, shutdown: F) -> Vec<CycleReport>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        let mut reports = Vec::new();
        let interval = self.config.cycle_interval();
        let mut cycle = 0u64;

        loop {
            cycle += 1;
            let start = Instant::now();

            let result = tokio::select! {
                result = self.run_cycle(cycle) => result,
                _ = &mut shutdown => {
                    info!(cycle, "Shutdown requested, abandoning cycle");
                    break;
                }
            };

            match result {
                Ok(report) => {
                    info!(
                        cycle,
                        executed = report.executed(),
                        succeeded = report.succeeded(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Cycle complete"
                    );
                    reports.push(report);
                }
                Err(e) => warn!(cycle, error = %e, "Cycle failed"),
            }

            if max_cycles.map(|max| cycle >= max).unwrap_or(false) {
                break;
            }

            let pause = interval.saturating_sub(start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping after cycle {}", cycle);
                    break;
                }
            }
        }

        reports
    }
}

/// Aborts a spawned pipeline when its cycle is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Derives a per-peer output path: `output.json` becomes `output.uid-7.json`.
pub fn output_path_for(base: &Path, uid: u16) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match base.extension() {
        Some(ext) => format!("{}.uid-{}.{}", stem, uid, ext.to_string_lossy()),
        None => format!("{}.uid-{}", stem, uid),
    };
    base.with_file_name(name)
}
