//! pgpromote - PostgreSQL Promotion Candidate Selector
//!
//! Probes every streaming replica of a PostgreSQL cluster for its WAL
//! receive/replay position and recommends the most advanced one for
//! promotion after a primary failure or a planned switchover.
//!
//! # Architecture
//!
//! A round fans one probe task out per replica, collects the outcomes
//! through a bounded channel and reduces them to a single candidate.
//! Probes fail independently: an unreachable, slow or incompatible replica
//! is reported and excluded, never fatal to the round.
//!
//! # Features
//!
//! - Legacy (`xlog`, pre-10) and modern (`wal`, 10+) position functions
//! - Per-probe timeout plus an optional deadline for the whole round
//! - Deterministic tie-break by input order
//! - Per-replica diagnostics explaining every exclusion
//!
//! pgpromote only recommends; it never promotes anything itself.

pub mod config;
pub mod error;
pub mod probe;
pub mod select;

pub use config::PromoteConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PromoteConfig;
    pub use crate::error::{Error, ProbeError, ProbeErrorKind, Result};
    pub use crate::probe::{
        resolve_dialect, Credentials, Dialect, PgPositionReader, PositionProbe, ProbeOutcome,
        ReplicaEndpoint, ReplicationPosition,
    };
    pub use crate::select::{Evaluation, Evaluator, ProbeReport, RankBy, SelectionResult};
}
