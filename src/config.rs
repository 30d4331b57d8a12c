//! pgpromote Configuration
//!
//! This module provides the configuration structures for a cluster whose
//! replicas are evaluated for promotion. The replica list is the static
//! topology a round runs against.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use sqlx::postgres::PgSslMode;

use crate::probe::{Credentials, DialectResolver, PgPositionReader, ReplicaEndpoint};
use crate::select::RankBy;

/// Main pgpromote configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteConfig {
    /// Cluster identity
    pub cluster: ClusterConfig,

    /// Credentials used for every replica
    pub credentials: CredentialsConfig,

    /// Probe timing and ranking
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Replicas to evaluate
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster identity and connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (used in log lines only)
    pub name: String,

    /// Default PostgreSQL port for replicas
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default database to connect to
    #[serde(default = "default_database")]
    pub database: String,
}

/// Admin credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Database user
    #[serde(default = "default_user")]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the password (used when `password` is unset)
    #[serde(default)]
    pub password_env: Option<String>,
}

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Per-replica timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on a whole round in milliseconds (0 = none)
    #[serde(default)]
    pub round_deadline_ms: u64,

    /// Offset replicas are ranked by
    #[serde(default)]
    pub rank_by: RankBy,

    /// TLS mode (disable, allow, prefer, require, verify-ca, verify-full)
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

/// One replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Display name (pod name)
    pub name: String,

    /// Host name or IP
    pub host: String,

    /// Port (defaults to `cluster.port`)
    #[serde(default)]
    pub port: Option<u16>,

    /// Database (defaults to `cluster.database`)
    #[serde(default)]
    pub database: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            round_deadline_ms: 0,
            rank_by: RankBy::default(),
            ssl_mode: default_ssl_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PromoteConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: PromoteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.name.is_empty() {
            return Err(crate::Error::Config("cluster.name cannot be empty".into()));
        }

        if self.credentials.user.is_empty() {
            return Err(crate::Error::Config("credentials.user cannot be empty".into()));
        }

        if self.probe.timeout_ms == 0 {
            return Err(crate::Error::Config("probe.timeout_ms must be greater than 0".into()));
        }

        self.ssl_mode()?;

        let mut names = HashSet::new();
        for replica in &self.replicas {
            if replica.name.is_empty() {
                return Err(crate::Error::Config("replica name cannot be empty".into()));
            }
            if replica.host.is_empty() {
                return Err(crate::Error::Config(format!(
                    "replica '{}' has an empty host",
                    replica.name
                )));
            }
            if !names.insert(replica.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "replica '{}' is listed more than once",
                    replica.name
                )));
            }
        }

        Ok(())
    }

    /// Get per-replica timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    /// Per-replica timeout, with an optional command-line override in milliseconds
    pub fn probe_timeout_or(&self, override_ms: Option<u64>) -> crate::Result<Duration> {
        match override_ms {
            Some(0) => Err(crate::Error::Config("timeout must be greater than 0".into())),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(self.probe_timeout()),
        }
    }

    /// Get the round deadline, if one is set
    pub fn round_deadline(&self) -> Option<Duration> {
        match self.probe.round_deadline_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Parse the configured TLS mode
    pub fn ssl_mode(&self) -> crate::Result<PgSslMode> {
        PgSslMode::from_str(&self.probe.ssl_mode).map_err(|e| {
            crate::Error::Config(format!("invalid probe.ssl_mode '{}': {}", self.probe.ssl_mode, e))
        })
    }

    /// Resolve the password, reading the environment if configured to
    pub fn password(&self) -> crate::Result<String> {
        if let Some(password) = &self.credentials.password {
            return Ok(password.clone());
        }

        match &self.credentials.password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                crate::Error::Config(format!("password environment variable {} is not set", var))
            }),
            None => Ok(String::new()),
        }
    }

    /// Build the endpoint list, filling in cluster defaults
    pub fn endpoints(&self) -> crate::Result<Vec<ReplicaEndpoint>> {
        let credentials = Credentials::new(self.credentials.user.clone(), self.password()?);

        Ok(self
            .replicas
            .iter()
            .map(|replica| {
                ReplicaEndpoint::new(
                    replica.name.clone(),
                    replica.host.clone(),
                    replica.port.unwrap_or(self.cluster.port),
                    replica
                        .database
                        .clone()
                        .unwrap_or_else(|| self.cluster.database.clone()),
                    credentials.clone(),
                )
            })
            .collect())
    }

    /// Build the PostgreSQL position reader for this cluster
    pub fn position_reader(&self) -> crate::Result<PgPositionReader> {
        Ok(PgPositionReader::new(DialectResolver::default(), self.ssl_mode()?))
    }

    /// Sample configuration written by `pgpromote init`
    pub fn sample(cluster: &str) -> String {
        format!(
            r#"# pgpromote configuration

[cluster]
name = "{cluster}"
port = 5432
database = "postgres"

[credentials]
user = "postgres"
# password = "change-me"
password_env = "PGPASSWORD"

[probe]
timeout_ms = 5000
# Bound on a whole round; 0 disables it
round_deadline_ms = 10000
# receive (default) or replay
rank_by = "receive"
ssl_mode = "prefer"

[[replicas]]
name = "{cluster}-replica-1"
host = "10.0.0.11"

[[replicas]]
name = "{cluster}-replica-2"
host = "10.0.0.12"

[logging]
level = "info"
format = "pretty"
"#,
            cluster = cluster
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[cluster]
name = "hippo"

[credentials]
user = "postgres"
password = "secret"

[probe]
timeout_ms = 2000
round_deadline_ms = 4000
rank_by = "replay"
ssl_mode = "disable"

[[replicas]]
name = "hippo-a"
host = "10.0.0.11"

[[replicas]]
name = "hippo-b"
host = "10.0.0.12"
port = 5433
database = "app"
"#;

    #[test]
    fn test_parse_config() {
        let config = PromoteConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.cluster.name, "hippo");
        assert_eq!(config.cluster.port, 5432);
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.round_deadline(), Some(Duration::from_secs(4)));
        assert_eq!(config.probe.rank_by, RankBy::Replay);
        assert!(matches!(config.ssl_mode().unwrap(), PgSslMode::Disable));
        assert_eq!(config.logging.level, "info");

        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].address(), "10.0.0.11:5432");
        assert_eq!(endpoints[0].database, "postgres");
        assert_eq!(endpoints[1].address(), "10.0.0.12:5433");
        assert_eq!(endpoints[1].database, "app");
        assert_eq!(endpoints[1].credentials.password, "secret");
    }

    #[test]
    fn test_defaults() {
        let config = PromoteConfig::from_str(
            r#"
[cluster]
name = "hippo"

[credentials]
"#,
        )
        .unwrap();

        assert_eq!(config.credentials.user, "postgres");
        assert_eq!(config.probe_timeout(), Duration::from_millis(5000));
        assert_eq!(config.round_deadline(), None);
        assert_eq!(config.probe.rank_by, RankBy::Receive);
        assert!(config.replicas.is_empty());
        assert!(config.endpoints().unwrap().is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = CONFIG.replace("hippo-b", "hippo-a");
        assert!(PromoteConfig::from_str(&duplicate).is_err());

        let bad_ssl = CONFIG.replace("\"disable\"", "\"sometimes\"");
        assert!(PromoteConfig::from_str(&bad_ssl).is_err());

        let zero_timeout = CONFIG.replace("timeout_ms = 2000", "timeout_ms = 0");
        assert!(PromoteConfig::from_str(&zero_timeout).is_err());

        let bad_rank = CONFIG.replace("\"replay\"", "\"flush\"");
        assert!(matches!(
            PromoteConfig::from_str(&bad_rank),
            Err(crate::Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_timeout_override() {
        let config = PromoteConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.probe_timeout_or(None).unwrap(), Duration::from_secs(2));
        assert_eq!(config.probe_timeout_or(Some(750)).unwrap(), Duration::from_millis(750));
        assert!(matches!(
            config.probe_timeout_or(Some(0)),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_password_from_env() {
        let var = "PGPROMOTE_TEST_PASSWORD_FROM_ENV";
        std::env::set_var(var, "from-env");

        let config = PromoteConfig::from_str(&format!(
            r#"
[cluster]
name = "hippo"

[credentials]
password_env = "{}"
"#,
            var
        ))
        .unwrap();
        assert_eq!(config.password().unwrap(), "from-env");

        let missing = PromoteConfig::from_str(
            r#"
[cluster]
name = "hippo"

[credentials]
password_env = "PGPROMOTE_TEST_UNSET_VARIABLE"
"#,
        )
        .unwrap();
        assert!(missing.password().is_err());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = PromoteConfig::from_str(&PromoteConfig::sample("hippo")).unwrap();
        assert_eq!(config.replicas.len(), 2);
        assert_eq!(config.replicas[0].name, "hippo-replica-1");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgpromote.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = PromoteConfig::from_file(&path).unwrap();
        assert_eq!(config.replicas.len(), 2);

        let missing = PromoteConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(crate::Error::Io(_))));
    }
}
