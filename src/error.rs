//! pgpromote Error Types
//!
//! Crate-level errors cover configuration and contract violations only.
//! Anything that goes wrong while probing a single replica is a
//! [`ProbeError`] and stays inside the evaluation round.

use std::time::Duration;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for pgpromote operations
pub type Result<T> = std::result::Result<T, Error>;

/// pgpromote error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Contract violations, rejected before any probe is dispatched
    #[error("Invalid endpoint '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },

    #[error("Duplicate endpoint name: {0}")]
    DuplicateEndpoint(String),

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stage of a probe at which a query was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    /// `server_version_num` lookup
    Version,
    /// Receive/replay offset lookup
    Position,
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStage::Version => write!(f, "version"),
            QueryStage::Position => write!(f, "position"),
        }
    }
}

/// Coarse classification of a probe failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// Could not reach or authenticate to the replica
    Connection,
    /// The server rejected or did not answer a query
    Query,
    /// The result set was empty or not a well-formed offset pair
    Parse,
    /// The round gave up on the probe
    Cancelled,
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeErrorKind::Connection => write!(f, "CONNECTION"),
            ProbeErrorKind::Query => write!(f, "QUERY"),
            ProbeErrorKind::Parse => write!(f, "PARSE"),
            ProbeErrorKind::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Failure of a single replica probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {address} after {timeout:?}")]
    ConnectionTimeout { address: String, timeout: Duration },

    #[error("{stage} query failed: {reason}")]
    QueryFailed { stage: QueryStage, reason: String },

    #[error("{stage} query timed out after {timeout:?}")]
    QueryTimeout { stage: QueryStage, timeout: Duration },

    #[error("{0} query returned no rows")]
    EmptyResult(QueryStage),

    #[error("Malformed {stage} result: {reason}")]
    Parse { stage: QueryStage, reason: String },

    #[error("Probe of {address} exceeded its {timeout:?} timeout")]
    ProbeTimeout { address: String, timeout: Duration },

    #[error("Round deadline exceeded before the probe finished")]
    DeadlineExceeded,

    #[error("Probe task ended without reporting: {0}")]
    ProbeLost(String),
}

impl ProbeError {
    /// Classify this failure
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::ConnectionFailed { .. } | ProbeError::ConnectionTimeout { .. } => {
                ProbeErrorKind::Connection
            }
            ProbeError::QueryFailed { .. } | ProbeError::QueryTimeout { .. } => {
                ProbeErrorKind::Query
            }
            ProbeError::EmptyResult(_) | ProbeError::Parse { .. } => ProbeErrorKind::Parse,
            ProbeError::ProbeTimeout { .. }
            | ProbeError::DeadlineExceeded
            | ProbeError::ProbeLost(_) => ProbeErrorKind::Cancelled,
        }
    }

    /// Check if this failure was caused by a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProbeError::ConnectionTimeout { .. }
                | ProbeError::QueryTimeout { .. }
                | ProbeError::ProbeTimeout { .. }
                | ProbeError::DeadlineExceeded
        )
    }
}

impl Serialize for ProbeError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ProbeError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("reason", &self.to_string())?;
        state.end()
    }
}
