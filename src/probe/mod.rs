//! Replica Probe Module
//!
//! Reads the WAL receive/replay position of a single standby.

pub mod dialect;
mod reader;

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ProbeError, Result};

pub use dialect::{resolve_dialect, Dialect, DialectResolver, MODERN_WAL_VERSION};
pub use reader::{parse_position_row, parse_server_version, PgPositionReader, VERSION_QUERY};

/// Login credentials for a replica
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One standby to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaEndpoint {
    /// Display name (pod or host name)
    pub name: String,
    /// Host name or IP address
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database to connect to
    pub database: String,
    /// Login credentials
    pub credentials: Credentials,
}

impl ReplicaEndpoint {
    /// Create a new endpoint
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            database: database.into(),
            credentials,
        }
    }

    /// `host:port` form used in log lines and errors
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject endpoints that cannot possibly be connected to
    pub fn validate(&self) -> Result<()> {
        let reason = if self.name.is_empty() {
            Some("name cannot be empty")
        } else if self.host.is_empty() {
            Some("host cannot be empty")
        } else if self.port == 0 {
            Some("port cannot be 0")
        } else if self.database.is_empty() {
            Some("database cannot be empty")
        } else if self.credentials.user.is_empty() {
            Some("user cannot be empty")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidEndpoint {
                name: self.name.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// WAL position of a standby, as byte offsets from `0/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationPosition {
    /// WAL received from the primary
    pub receive_offset: u64,
    /// WAL replayed locally
    pub replay_offset: u64,
}

impl ReplicationPosition {
    pub fn new(receive_offset: u64, replay_offset: u64) -> Self {
        Self {
            receive_offset,
            replay_offset,
        }
    }

    /// Replay cannot outrun receipt on a healthy standby
    pub fn is_consistent(&self) -> bool {
        self.replay_offset <= self.receive_offset
    }

    /// Bytes received but not yet replayed
    pub fn replay_lag(&self) -> u64 {
        self.receive_offset.saturating_sub(self.replay_offset)
    }
}

/// Result of probing one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success(ReplicationPosition),
    Failure(ProbeError),
}

impl ProbeOutcome {
    pub fn position(&self) -> Option<&ReplicationPosition> {
        match self {
            ProbeOutcome::Success(position) => Some(position),
            ProbeOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match self {
            ProbeOutcome::Success(_) => None,
            ProbeOutcome::Failure(err) => Some(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }
}

impl From<std::result::Result<ReplicationPosition, ProbeError>> for ProbeOutcome {
    fn from(result: std::result::Result<ReplicationPosition, ProbeError>) -> Self {
        match result {
            Ok(position) => ProbeOutcome::Success(position),
            Err(err) => ProbeOutcome::Failure(err),
        }
    }
}

/// Source of replication positions
///
/// Implementations must bound the call by `timeout` and report every
/// failure as [`ProbeOutcome::Failure`] rather than panicking.
#[async_trait::async_trait]
pub trait PositionProbe: Send + Sync + 'static {
    async fn read_position(&self, endpoint: &ReplicaEndpoint, timeout: Duration) -> ProbeOutcome;
}
