//! External collaborators of the validator loop.
//!
//! The peer transport and the reward ledger live outside this crate; the
//! loop only sees them through [`PeerSource`] and [`RewardSink`]. File-backed
//! implementations are provided for running the validator from the CLI.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::ValidatorError;
use crate::reward::PeerResponse;

/// One queried peer and whatever it answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Peer identifier used by the reward ledger.
    pub uid: u16,
    /// The peer's response; `None` for a non-response.
    pub response: Option<PeerResponse>,
}

impl Candidate {
    /// Creates a candidate that answered with `github_url`.
    pub fn new(uid: u16, github_url: impl Into<String>) -> Self {
        Self {
            uid,
            response: Some(PeerResponse::new(github_url)),
        }
    }

    /// Creates a candidate that did not answer.
    pub fn silent(uid: u16) -> Self {
        Self {
            uid,
            response: None,
        }
    }

    /// The repository reference to run, if the peer supplied a non-empty one.
    pub fn reference(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.github_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

/// Rejects candidate lists in which a uid appears twice.
///
/// Outputs and rewards are keyed by uid, so duplicates would collide.
pub fn check_unique_uids(candidates: &[Candidate]) -> Result<(), ValidatorError> {
    let mut seen = HashSet::with_capacity(candidates.len());
    for candidate in candidates {
        if !seen.insert(candidate.uid) {
            return Err(ValidatorError::PeerQuery(format!(
                "uid {} appears more than once",
                candidate.uid
            )));
        }
    }
    Ok(())
}

/// Supplies the candidates for one cycle.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Queries peers for their agent references.
    async fn query(&self) -> Result<Vec<Candidate>, ValidatorError>;
}

/// Receives the rewards computed at the end of a cycle.
#[async_trait]
pub trait RewardSink: Send + Sync {
    /// Records `rewards[i]` for `uids[i]`.
    async fn update_scores(&self, rewards: &[f32], uids: &[u16]) -> Result<(), ValidatorError>;
}

/// Reads candidates from a JSON file on every query.
///
/// The file holds an array whose entries are either `null` (a non-response)
/// or an object with an optional `uid` and an optional `github_url`. Entries
/// without a `uid` take their array index.
#[derive(Debug, Clone)]
pub struct FilePeerSource {
    path: PathBuf,
}

impl FilePeerSource {
    /// Creates a source backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parses the candidate file format.
    pub fn parse(content: &str) -> Result<Vec<Candidate>, ValidatorError> {
        let entries: Vec<Value> = serde_json::from_str(content)?;
        let mut candidates = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let default_uid = u16::try_from(index).map_err(|_| {
                ValidatorError::PeerQuery(format!("too many peers in file ({})", index + 1))
            })?;

            let candidate = match entry {
                Value::Null => Candidate::silent(default_uid),
                Value::Object(_) => {
                    let uid = match entry.get("uid") {
                        None | Some(Value::Null) => default_uid,
                        Some(v) => v
                            .as_u64()
                            .and_then(|n| u16::try_from(n).ok())
                            .ok_or_else(|| {
                                ValidatorError::PeerQuery(format!(
                                    "entry {} has an invalid uid: {}",
                                    index, v
                                ))
                            })?,
                    };
                    Candidate {
                        uid,
                        response: Some(serde_json::from_value(entry)?),
                    }
                }
                other => {
                    return Err(ValidatorError::PeerQuery(format!(
                        "entry {} must be an object or null, got {}",
                        index, other
                    )))
                }
            };
            candidates.push(candidate);
        }

        check_unique_uids(&candidates)?;
        Ok(candidates)
    }
}

#[async_trait]
impl PeerSource for FilePeerSource {
    async fn query(&self) -> Result<Vec<Candidate>, ValidatorError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ValidatorError::PeerQuery(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let candidates = Self::parse(&content)?;
        debug!(path = %self.path.display(), count = candidates.len(), "Loaded peer responses");
        Ok(candidates)
    }
}

/// Appends one JSON line per cycle to a file.
#[derive(Debug, Clone)]
pub struct JsonlRewardSink {
    path: PathBuf,
}

impl JsonlRewardSink {
    /// Creates a sink appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RewardSink for JsonlRewardSink {
    async fn update_scores(&self, rewards: &[f32], uids: &[u16]) -> Result<(), ValidatorError> {
        if rewards.len() != uids.len() {
            return Err(ValidatorError::RewardSink(format!(
                "{} rewards for {} uids",
                rewards.len(),
                uids.len()
            )));
        }

        let line = serde_json::to_string(&json!({
            "timestamp": Utc::now(),
            "uids": uids,
            "rewards": rewards,
        }))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Logs rewards without recording them anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRewardSink;

#[async_trait]
impl RewardSink for LogRewardSink {
    async fn update_scores(&self, rewards: &[f32], uids: &[u16]) -> Result<(), ValidatorError> {
        info!(?uids, ?rewards, "Updated scores");
        Ok(())
    }
}
