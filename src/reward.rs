// Reward calculation for peer responses
// Scores each response from the surface syntax of its repository reference

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::info;

use crate::runner::PipelineOutcome;

/// Prefix a reference must start with to earn a reward.
pub const DEFAULT_REWARD_PREFIX: &str = "https://github.com";

/// What a peer sent back when asked for its agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Repository reference; non-string values are treated as absent.
    #[serde(default, deserialize_with = "string_or_none")]
    pub github_url: Option<String>,
}

impl PeerResponse {
    /// Create a response carrying a repository reference
    pub fn new(github_url: impl Into<String>) -> Self {
        Self {
            github_url: Some(github_url.into()),
        }
    }
}

fn string_or_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Which signal decides the reward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMode {
    /// Score the reference string alone, regardless of what the agent did
    #[default]
    ReferenceSyntax,
    /// Require a valid reference and a successful pipeline run
    ExecutionOutcome,
}

impl std::str::FromStr for RewardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "reference_syntax" | "syntax" => Ok(RewardMode::ReferenceSyntax),
            "execution_outcome" | "outcome" => Ok(RewardMode::ExecutionOutcome),
            other => Err(format!("Unknown reward mode: {}", other)),
        }
    }
}

/// Reward a single response against the default prefix
pub fn reward(response: Option<&PeerResponse>) -> f32 {
    reward_with_prefix(response, DEFAULT_REWARD_PREFIX)
}

/// Reward a single response: 1.0 for a non-empty reference starting with `prefix`, else 0.0
pub fn reward_with_prefix(response: Option<&PeerResponse>, prefix: &str) -> f32 {
    let Some(response) = response else {
        info!("Reward: response is None");
        return 0.0;
    };

    match response.github_url.as_deref() {
        Some(url) if !url.is_empty() && url.starts_with(prefix) => {
            info!(github_url = %url, "Reward: valid github_url received");
            1.0
        }
        other => {
            info!(github_url = ?other, "Reward: invalid or missing github_url");
            0.0
        }
    }
}

/// Compute rewards for all responses, positionally aligned
pub fn get_rewards(responses: &[Option<PeerResponse>]) -> Vec<f32> {
    responses.iter().map(|r| reward(r.as_ref())).collect()
}

/// Configurable scorer used by the validator loop
#[derive(Debug, Clone)]
pub struct Scorer {
    prefix: String,
    mode: RewardMode,
}

impl Scorer {
    /// Create a scorer
    pub fn new(prefix: impl Into<String>, mode: RewardMode) -> Self {
        Self {
            prefix: prefix.into(),
            mode,
        }
    }

    /// The active reward mode
    pub fn mode(&self) -> RewardMode {
        self.mode
    }

    /// Score one response, optionally taking its pipeline outcome into account
    pub fn score(&self, response: Option<&PeerResponse>, outcome: Option<&PipelineOutcome>) -> f32 {
        let syntax = reward_with_prefix(response, &self.prefix);
        match self.mode {
            RewardMode::ReferenceSyntax => syntax,
            RewardMode::ExecutionOutcome => {
                if outcome.map(|o| o.is_success()).unwrap_or(false) {
                    syntax
                } else {
                    0.0
                }
            }
        }
    }

    /// Score all responses; `outcomes` must be aligned with `responses`
    pub fn score_all(
        &self,
        responses: &[Option<PeerResponse>],
        outcomes: &[Option<PipelineOutcome>],
    ) -> Vec<f32> {
        responses
            .iter()
            .enumerate()
            .map(|(i, r)| self.score(r.as_ref(), outcomes.get(i).and_then(|o| o.as_ref())))
            .collect()
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(DEFAULT_REWARD_PREFIX, RewardMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::time::Duration;

    fn outcome(success: bool) -> PipelineOutcome {
        if success {
            PipelineOutcome::success(
                "r",
                "https://github.com/a/b",
                serde_json::json!({}),
                PathBuf::from("output.json"),
                Utc::now(),
                Duration::ZERO,
            )
        } else {
            PipelineOutcome::failure(
                "r",
                "https://github.com/a/b",
                &PipelineError::Load("boom".into()),
                Utc::now(),
                Duration::ZERO,
            )
        }
    }

    #[test]
    fn test_none_scores_zero() {
        assert_eq!(reward(None), 0.0);
    }

    #[test]
    fn test_prefix_match_scores_one() {
        for url in [
            "https://github.com",
            "https://github.com/org/repo",
            "https://github.com.evil.example/x",
            "https://github.com/org/repo with spaces",
        ] {
            assert_eq!(reward(Some(&PeerResponse::new(url))), 1.0, "{}", url);
        }
    }

    #[test]
    fn test_other_references_score_zero() {
        for url in [
            "",
            "http://github.com/org/repo",
            "https://gitlab.com/org/repo",
            " https://github.com/org/repo",
            "HTTPS://GITHUB.COM/org/repo",
            "git@github.com:org/repo.git",
        ] {
            assert_eq!(reward(Some(&PeerResponse::new(url))), 0.0, "{}", url);
        }
        assert_eq!(reward(Some(&PeerResponse::default())), 0.0);
    }

    #[test]
    fn test_get_rewards_aligned() {
        let responses = vec![
            Some(PeerResponse::new("https://github.com/a/b")),
            None,
            Some(PeerResponse::new("ftp://nope")),
            Some(PeerResponse::default()),
        ];
        assert_eq!(get_rewards(&responses), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(get_rewards(&[]).is_empty());
    }

    #[test]
    fn test_non_string_reference_is_absent() {
        let response: PeerResponse = serde_json::from_str(r#"{"github_url": 42}"#).unwrap();
        assert_eq!(response.github_url, None);

        let response: PeerResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(response.github_url, None);
    }

    #[test]
    fn test_execution_outcome_mode() {
        let scorer = Scorer::new(DEFAULT_REWARD_PREFIX, RewardMode::ExecutionOutcome);
        let valid = PeerResponse::new("https://github.com/a/b");
        let invalid = PeerResponse::new("https://example.com/a/b");

        assert_eq!(scorer.score(Some(&valid), Some(&outcome(true))), 1.0);
        assert_eq!(scorer.score(Some(&valid), Some(&outcome(false))), 0.0);
        assert_eq!(scorer.score(Some(&valid), None), 0.0);
        assert_eq!(scorer.score(Some(&invalid), Some(&outcome(true))), 0.0);
    }

    #[test]
    fn test_reference_syntax_mode_ignores_outcome() {
        let scorer = Scorer::default();
        let valid = PeerResponse::new("https://github.com/a/b");
        assert_eq!(scorer.score(Some(&valid), Some(&outcome(false))), 1.0);
        assert_eq!(
            scorer.score_all(&[Some(valid), None], &[None, None]),
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_reward_mode_from_str() {
        assert_eq!("reference-syntax".parse::<RewardMode>().unwrap(), RewardMode::ReferenceSyntax);
        assert_eq!("execution_outcome".parse::<RewardMode>().unwrap(), RewardMode::ExecutionOutcome);
        assert!("bogus".parse::<RewardMode>().is_err());
    }
}
