//! Candidate Selection Module
//!
//! Probes every replica of a round concurrently and picks the most advanced
//! one as the promotion candidate.

mod evaluator;
mod ranking;

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::probe::{ProbeOutcome, ReplicaEndpoint, ReplicationPosition};

pub use evaluator::{validate_endpoints, Evaluator, PROBE_TIMEOUT_SLACK};
pub use ranking::most_advanced;

/// Offset used to rank replicas
///
/// Receive offset is the default: the freshest WAL stream loses the least
/// data on promotion. Replay offset favours the replica whose data is
/// already visible and is opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankBy {
    #[default]
    Receive,
    Replay,
}

impl RankBy {
    /// Offset of `position` under this ranking
    pub fn offset(&self, position: &ReplicationPosition) -> u64 {
        match self {
            RankBy::Receive => position.receive_offset,
            RankBy::Replay => position.replay_offset,
        }
    }
}

impl std::fmt::Display for RankBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankBy::Receive => write!(f, "receive"),
            RankBy::Replay => write!(f, "replay"),
        }
    }
}

impl std::str::FromStr for RankBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "receive" => Ok(RankBy::Receive),
            "replay" => Ok(RankBy::Replay),
            other => Err(format!("unknown ranking '{}', expected receive or replay", other)),
        }
    }
}

/// Outcome of one selection round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "endpoint", rename_all = "snake_case")]
pub enum SelectionResult {
    Candidate(ReplicaEndpoint),
    NoCandidate,
}

impl SelectionResult {
    pub fn candidate(&self) -> Option<&ReplicaEndpoint> {
        match self {
            SelectionResult::Candidate(endpoint) => Some(endpoint),
            SelectionResult::NoCandidate => None,
        }
    }
}

/// Diagnostic record for one probed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub endpoint: ReplicaEndpoint,
    pub outcome: ProbeOutcome,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

/// Everything a round produced, reports in input order
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// When the round was dispatched
    pub started_at: DateTime<Utc>,
    /// Ranking used for the selection
    pub rank_by: RankBy,
    /// Selected endpoint, if any
    pub result: SelectionResult,
    /// Index of the candidate within `reports`
    pub candidate_index: Option<usize>,
    /// One report per input endpoint
    pub reports: Vec<ProbeReport>,
}

impl Evaluation {
    pub fn candidate(&self) -> Option<&ReplicaEndpoint> {
        self.result.candidate()
    }

    pub fn candidate_report(&self) -> Option<&ProbeReport> {
        self.candidate_index.and_then(|index| self.reports.get(index))
    }

    pub fn successes(&self) -> impl Iterator<Item = &ProbeReport> {
        self.reports.iter().filter(|r| r.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeReport> {
        self.reports.iter().filter(|r| !r.outcome.is_success())
    }

    /// Bytes the report at `index` trails the candidate, by the round's ranking
    pub fn gap_to_candidate(&self, index: usize) -> Option<u64> {
        let best = self.candidate_report()?.outcome.position()?;
        let position = self.reports.get(index)?.outcome.position()?;
        Some(
            self.rank_by
                .offset(best)
                .saturating_sub(self.rank_by.offset(position)),
        )
    }
}
