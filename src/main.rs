//! pgpromote - PostgreSQL Promotion Candidate Selector
//!
//! Probes the replicas listed in the configuration file and reports which
//! one is the most advanced promotion candidate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgpromote::config::{LoggingConfig, PromoteConfig};
use pgpromote::error::{Error, Result};
use pgpromote::probe::{resolve_dialect, PositionProbe, ProbeOutcome};
use pgpromote::select::{Evaluation, Evaluator, RankBy};

/// Exit status for configuration and contract errors
const EXIT_FAILURE: i32 = 1;

/// Exit status when no replica qualifies (or a single probe fails)
const EXIT_NO_CANDIDATE: i32 = 2;

/// pgpromote - PostgreSQL Promotion Candidate Selector
#[derive(Parser)]
#[command(name = "pgpromote")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pgpromote.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every replica and select the promotion candidate
    Select {
        /// Per-replica timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Deadline for the whole round in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Offset to rank replicas by (receive, replay)
        #[arg(long)]
        rank_by: Option<RankBy>,

        /// Print the evaluation as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe a single configured replica
    Probe {
        /// Replica name as listed in the configuration
        name: String,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show the WAL functions used for a server_version_num
    Dialect {
        /// Server version number (e.g. 90624, 140005)
        version: i64,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pgpromote.toml")]
        output: PathBuf,

        /// Cluster name
        #[arg(long, default_value = "hippo")]
        cluster: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads
    let mut logging = PromoteConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging);

    let result = match cli.command {
        Commands::Select { timeout_ms, deadline_ms, rank_by, json } => {
            run_select(&cli.config, timeout_ms, deadline_ms, rank_by, json).await
        }
        Commands::Probe { name, timeout_ms } => run_probe(&cli.config, &name, timeout_ms).await,
        Commands::Dialect { version } => run_dialect(version),
        Commands::Init { output, cluster, force } => run_init(output, &cluster, force),
        Commands::Validate => run_validate(&cli.config),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}

/// Initialize logging (to stderr, so stdout stays parseable)
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Load configuration, logging where it came from
fn load_config(config_path: &Path) -> Result<PromoteConfig> {
    match PromoteConfig::from_file(config_path) {
        Ok(config) => {
            tracing::debug!("Loaded configuration for cluster {} from {:?}", config.cluster.name, config_path);
            Ok(config)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            Err(e)
        }
    }
}

/// Run one selection round
async fn run_select(
    config_path: &Path,
    timeout_ms: Option<u64>,
    deadline_ms: Option<u64>,
    rank_by: Option<RankBy>,
    json: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let endpoints = config.endpoints()?;

    let probe_timeout = config.probe_timeout_or(timeout_ms)?;
    let round_deadline = match deadline_ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => config.round_deadline(),
    };

    let mut evaluator = Evaluator::new(config.position_reader()?)
        .with_rank_by(rank_by.unwrap_or(config.probe.rank_by));
    if let Some(deadline) = round_deadline {
        evaluator = evaluator.with_round_deadline(deadline);
    }

    tracing::info!("Evaluating cluster {}", config.cluster.name);
    let evaluation = evaluator.select_candidate(&endpoints, probe_timeout).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
    } else {
        print_evaluation(&config.cluster.name, &evaluation);
    }

    Ok(match evaluation.candidate() {
        Some(_) => 0,
        None => EXIT_NO_CANDIDATE,
    })
}

fn print_evaluation(cluster: &str, evaluation: &Evaluation) {
    println!();
    println!(
        "Cluster {}: {} replica(s), ranking by {} offset",
        cluster,
        evaluation.reports.len(),
        evaluation.rank_by
    );
    println!();
    println!(
        "  {:<24} {:<22} {:>16} {:>16} {:>12} {:>12} {:>8}",
        "REPLICA", "ADDRESS", "RECEIVE", "REPLAY", "REPLAY LAG", "BEHIND", "TIME"
    );

    for (index, report) in evaluation.reports.iter().enumerate() {
        let marker = if evaluation.candidate_index == Some(index) { "*" } else { " " };
        let elapsed = format!("{}ms", report.elapsed.as_millis());

        match &report.outcome {
            ProbeOutcome::Success(position) => {
                let behind = evaluation
                    .gap_to_candidate(index)
                    .map(|gap| gap.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {:<24} {:<22} {:>16} {:>16} {:>12} {:>12} {:>8}",
                    marker,
                    report.endpoint.name,
                    report.endpoint.address(),
                    position.receive_offset,
                    position.replay_offset,
                    position.replay_lag(),
                    behind,
                    elapsed
                );
                if !position.is_consistent() {
                    println!("    \x1b[1;33m! replay offset is ahead of receive offset\x1b[0m");
                }
            }
            ProbeOutcome::Failure(err) => {
                println!(
                    "{} {:<24} {:<22} {:>16} {:>16} {:>12} {:>12} {:>8}",
                    marker,
                    report.endpoint.name,
                    report.endpoint.address(),
                    "-",
                    "-",
                    "-",
                    "-",
                    elapsed
                );
                println!("    \x1b[1;31m✗ {} failure:\x1b[0m {}", err.kind(), err);
            }
        }
    }

    println!();
    match evaluation.candidate() {
        Some(endpoint) => println!(
            "\x1b[1;32m✓\x1b[0m Selected replica: {} ({})",
            endpoint.name,
            endpoint.address()
        ),
        None => println!("\x1b[1;31m✗ No promotion candidate\x1b[0m"),
    }
}

/// Probe a single replica
async fn run_probe(config_path: &Path, name: &str, timeout_ms: Option<u64>) -> Result<i32> {
    let config = load_config(config_path)?;
    let endpoint = config
        .endpoints()?
        .into_iter()
        .find(|endpoint| endpoint.name == name)
        .ok_or_else(|| Error::UnknownReplica(name.to_string()))?;

    let probe_timeout = config.probe_timeout_or(timeout_ms)?;

    let reader = config.position_reader()?;
    match reader.read_position(&endpoint, probe_timeout).await {
        ProbeOutcome::Success(position) => {
            println!("Replica:     {} ({})", endpoint.name, endpoint.address());
            println!("Receive:     {}", position.receive_offset);
            println!("Replay:      {}", position.replay_offset);
            println!("Replay lag:  {} bytes", position.replay_lag());
            Ok(0)
        }
        ProbeOutcome::Failure(err) => {
            println!("Replica:     {} ({})", endpoint.name, endpoint.address());
            println!("\x1b[1;31m✗ {} failure:\x1b[0m {}", err.kind(), err);
            Ok(EXIT_NO_CANDIDATE)
        }
    }
}

/// Show the dialect for a server version
fn run_dialect(version: i64) -> Result<i32> {
    let dialect = resolve_dialect(version);

    println!("Server version:  {}", version);
    println!("Dialect:         {}", dialect);
    println!("Receive:         {}()", dialect.receive_fn);
    println!("Replay:          {}()", dialect.replay_fn);
    println!("Diff:            {}()", dialect.diff_fn);
    println!();
    println!("{}", dialect.position_query());

    Ok(0)
}

/// Write a sample configuration file
fn run_init(output: PathBuf, cluster: &str, force: bool) -> Result<i32> {
    if output.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            output.display()
        )));
    }

    std::fs::write(&output, PromoteConfig::sample(cluster))?;
    println!("Configuration written to {}", output.display());

    Ok(0)
}

/// Validate the configuration file
fn run_validate(config_path: &Path) -> Result<i32> {
    match PromoteConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Cluster:      {}", config.cluster.name);
            println!("  User:         {}", config.credentials.user);
            println!("  Replicas:     {}", config.replicas.len());
            for replica in &config.replicas {
                println!(
                    "    - {} ({}:{})",
                    replica.name,
                    replica.host,
                    replica.port.unwrap_or(config.cluster.port)
                );
            }
            println!("  Timeout:      {} ms", config.probe.timeout_ms);
            match config.round_deadline() {
                Some(deadline) => println!("  Deadline:     {} ms", deadline.as_millis()),
                None => println!("  Deadline:     none"),
            }
            println!("  Rank by:      {}", config.probe.rank_by);
            Ok(0)
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Ok(EXIT_FAILURE)
        }
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
ssl_mode = "disable"

[[replicas]]
name = "hippo-a"
host = "127.0.0.1"
port = 1
"#;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("pgpromote.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_zero_timeout_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, CONFIG);

        let result = run_select(&path, Some(0), None, None, true).await;
        assert!(matches!(result, Err(Error::Config(_))));

        let result = run_probe(&path, "hippo-a", Some(0)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_exit_codes() {
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, CONFIG);
        assert_eq!(run_validate(&path).unwrap(), 0);

        let path = write_config(&dir, &CONFIG.replace("name = \"hippo\"", "name = \"\""));
        assert_eq!(run_validate(&path).unwrap(), EXIT_FAILURE);
    }
}
