//! Round Evaluator
//!
//! Fans probes out onto the runtime, fans their outcomes back in through a
//! bounded channel and reduces them to a single candidate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};

use super::{most_advanced, Evaluation, ProbeReport, RankBy, SelectionResult};
use crate::error::{Error, ProbeError, Result};
use crate::probe::{PositionProbe, ProbeOutcome, ReplicaEndpoint};

/// Extra time a probe gets past its own timeout before the evaluator cuts it off
pub const PROBE_TIMEOUT_SLACK: Duration = Duration::from_millis(250);

/// Message sent by each probe task: (input index, outcome, elapsed)
type ProbeMessage = (usize, ProbeOutcome, Duration);

/// Selects a promotion candidate from a set of replicas
pub struct Evaluator<P: PositionProbe> {
    /// Position source shared by all probe tasks
    probe: Arc<P>,
    /// Offset replicas are ranked by
    rank_by: RankBy,
    /// Aggregate bound on one round
    round_deadline: Option<Duration>,
}

impl<P: PositionProbe> Evaluator<P> {
    /// Create a new evaluator ranking by receive offset with no round deadline
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
            rank_by: RankBy::default(),
            round_deadline: None,
        }
    }

    pub fn with_rank_by(mut self, rank_by: RankBy) -> Self {
        self.rank_by = rank_by;
        self
    }

    /// Bound the whole round; probes still running past it count as failures
    pub fn with_round_deadline(mut self, deadline: Duration) -> Self {
        self.round_deadline = Some(deadline);
        self
    }

    pub fn rank_by(&self) -> RankBy {
        self.rank_by
    }

    pub fn round_deadline(&self) -> Option<Duration> {
        self.round_deadline
    }

    /// Run one round over `endpoints`
    ///
    /// Per-replica failures never surface as `Err`; only a malformed endpoint
    /// list does, and it is rejected before anything is dispatched.
    pub async fn select_candidate(
        &self,
        endpoints: &[ReplicaEndpoint],
        probe_timeout: Duration,
    ) -> Result<Evaluation> {
        validate_endpoints(endpoints)?;

        let started_at = Utc::now();
        tracing::info!(
            "Evaluating {} replica(s) (timeout {:?}, ranking by {} offset)",
            endpoints.len(),
            probe_timeout,
            self.rank_by
        );

        let outcomes = self.probe_all(endpoints, probe_timeout).await;

        let reports: Vec<ProbeReport> = endpoints
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(endpoint, (outcome, elapsed))| ProbeReport {
                endpoint,
                outcome,
                elapsed,
            })
            .collect();

        for report in &reports {
            match &report.outcome {
                ProbeOutcome::Success(position) => tracing::info!(
                    "{}: receive={} replay={} ({:?})",
                    report.endpoint.name,
                    position.receive_offset,
                    position.replay_offset,
                    report.elapsed
                ),
                ProbeOutcome::Failure(err) => tracing::warn!(
                    "{}: excluded, {} failure: {}",
                    report.endpoint.name,
                    err.kind(),
                    err
                ),
            }
        }

        let candidate_index = most_advanced(&reports, self.rank_by);
        let result = match candidate_index {
            Some(index) => SelectionResult::Candidate(reports[index].endpoint.clone()),
            None => SelectionResult::NoCandidate,
        };

        match &result {
            SelectionResult::Candidate(endpoint) => {
                tracing::info!("Selected {} as promotion candidate", endpoint.name)
            }
            SelectionResult::NoCandidate => {
                tracing::warn!("No promotion candidate: no replica reported a position")
            }
        }

        Ok(Evaluation {
            started_at,
            rank_by: self.rank_by,
            result,
            candidate_index,
            reports,
        })
    }

    /// Probe every endpoint concurrently; outcomes come back in input order
    async fn probe_all(
        &self,
        endpoints: &[ReplicaEndpoint],
        probe_timeout: Duration,
    ) -> Vec<(ProbeOutcome, Duration)> {
        if endpoints.is_empty() {
            return Vec::new();
        }

        let round_started = Instant::now();
        let (tx, mut rx) = mpsc::channel::<ProbeMessage>(endpoints.len());
        let mut tasks = JoinSet::new();

        for (index, endpoint) in endpoints.iter().enumerate() {
            let probe = Arc::clone(&self.probe);
            let endpoint = endpoint.clone();
            let tx = tx.clone();

            tasks.spawn(async move {
                let started = Instant::now();
                let guard = probe_timeout + PROBE_TIMEOUT_SLACK;
                let outcome = match timeout(guard, probe.read_position(&endpoint, probe_timeout)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Failure(ProbeError::ProbeTimeout {
                        address: endpoint.address(),
                        timeout: probe_timeout,
                    }),
                };
                // Receiver is gone only if the round was abandoned
                let _ = tx.send((index, outcome, started.elapsed())).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<(ProbeOutcome, Duration)>> = endpoints.iter().map(|_| None).collect();

        let collect = async {
            while let Some((index, outcome, elapsed)) = rx.recv().await {
                slots[index] = Some((outcome, elapsed));
            }
        };

        let deadline_hit = match self.round_deadline {
            Some(deadline) => timeout_at(round_started + deadline, collect).await.is_err(),
            None => {
                collect.await;
                false
            }
        };

        if deadline_hit {
            tasks.abort_all();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("Probe task panicked: {}", e);
                }
            }
        }

        let round_elapsed = round_started.elapsed();
        let missing = slots.iter().filter(|slot| slot.is_none()).count();
        if deadline_hit && missing > 0 {
            tracing::warn!(
                "Round deadline passed after {:?} with {} probe(s) still in flight",
                round_elapsed,
                missing
            );
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let err = if deadline_hit {
                        ProbeError::DeadlineExceeded
                    } else {
                        ProbeError::ProbeLost("task exited without a result".to_string())
                    };
                    (ProbeOutcome::Failure(err), round_elapsed)
                })
            })
            .collect()
    }
}

/// Reject endpoint lists that cannot be evaluated
pub fn validate_endpoints(endpoints: &[ReplicaEndpoint]) -> Result<()> {
    let mut seen = HashSet::new();

    for endpoint in endpoints {
        endpoint.validate()?;
        if !seen.insert(endpoint.name.as_str()) {
            return Err(Error::DuplicateEndpoint(endpoint.name.clone()));
        }
    }

    Ok(())
}
