//! Validator loop.
//!
//! One cycle queries peers for agent references, runs each reference through
//! the [`crate::runner`] pipeline (concurrently, bounded), waits for all of
//! them to finish, and then hands positionally aligned rewards to the
//! reward sink.

pub mod cycle;
pub mod peers;

pub use cycle::{output_path_for, CycleReport, Validator};
pub use peers::{check_unique_uids, Candidate, FilePeerSource, JsonlRewardSink, LogRewardSink, PeerSource, RewardSink};
