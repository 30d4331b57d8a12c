//! PostgreSQL Position Reader
//!
//! Opens one short-lived connection per probe, detects the server's WAL
//! function dialect and reads the receive/replay offsets.

use std::time::Duration;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use tokio::time::{timeout, timeout_at, Instant};

use super::{DialectResolver, PositionProbe, ProbeOutcome, ReplicaEndpoint, ReplicationPosition};
use crate::error::{ProbeError, QueryStage};

/// Server version lookup, answered as text (e.g. `"140005"`)
pub const VERSION_QUERY: &str = "SELECT current_setting('server_version_num')";

/// Grace period for a polite connection close; must fit inside the
/// evaluator's `PROBE_TIMEOUT_SLACK`
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Application name reported in `pg_stat_activity`
const APPLICATION_NAME: &str = "pgpromote";

/// Reads replication positions over the PostgreSQL wire protocol
#[derive(Debug, Clone)]
pub struct PgPositionReader {
    /// Dialects to choose from once the version is known
    dialects: DialectResolver,
    /// TLS mode for replica connections
    ssl_mode: PgSslMode,
}

impl PgPositionReader {
    /// Create a new reader
    pub fn new(dialects: DialectResolver, ssl_mode: PgSslMode) -> Self {
        Self { dialects, ssl_mode }
    }

    fn connect_options(&self, endpoint: &ReplicaEndpoint) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.credentials.user)
            .password(&endpoint.credentials.password)
            .database(&endpoint.database)
            .ssl_mode(self.ssl_mode)
            .application_name(APPLICATION_NAME)
            .disable_statement_logging()
    }

    /// Probe without the outcome wrapper
    async fn probe(
        &self,
        endpoint: &ReplicaEndpoint,
        probe_timeout: Duration,
    ) -> Result<ReplicationPosition, ProbeError> {
        let deadline = Instant::now() + probe_timeout;
        let options = self.connect_options(endpoint);

        let mut conn = match timeout_at(deadline, PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(ProbeError::ConnectionFailed {
                    address: endpoint.address(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ProbeError::ConnectionTimeout {
                    address: endpoint.address(),
                    timeout: probe_timeout,
                })
            }
        };

        let result = self.query_position(&mut conn, deadline, probe_timeout).await;

        // Release on every path; a failed close still drops the socket
        match timeout(CLOSE_GRACE, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Error closing connection to {}: {}", endpoint.name, e),
            Err(_) => tracing::debug!("Close timed out for {}, dropping connection", endpoint.name),
        }

        result
    }

    /// Run the version and position queries on an open connection
    async fn query_position(
        &self,
        conn: &mut PgConnection,
        deadline: Instant,
        probe_timeout: Duration,
    ) -> Result<ReplicationPosition, ProbeError> {
        let version = timeout_at(
            deadline,
            sqlx::query_scalar::<_, String>(VERSION_QUERY).fetch_optional(&mut *conn),
        )
        .await
        .map_err(|_| ProbeError::QueryTimeout {
            stage: QueryStage::Version,
            timeout: probe_timeout,
        })?
        .map_err(|e| ProbeError::QueryFailed {
            stage: QueryStage::Version,
            reason: e.to_string(),
        })?;

        let version = parse_server_version(version)?;
        let dialect = self.dialects.resolve(version);
        let query = dialect.position_query();

        tracing::debug!("Server version {} uses {} dialect", version, dialect);

        let row = timeout_at(
            deadline,
            sqlx::query_as::<_, (Option<i64>, Option<i64>)>(&query).fetch_optional(&mut *conn),
        )
        .await
        .map_err(|_| ProbeError::QueryTimeout {
            stage: QueryStage::Position,
            timeout: probe_timeout,
        })?
        .map_err(|e| ProbeError::QueryFailed {
            stage: QueryStage::Position,
            reason: e.to_string(),
        })?;

        parse_position_row(row)
    }
}

impl Default for PgPositionReader {
    fn default() -> Self {
        Self::new(DialectResolver::default(), PgSslMode::Prefer)
    }
}

#[async_trait::async_trait]
impl PositionProbe for PgPositionReader {
    async fn read_position(&self, endpoint: &ReplicaEndpoint, timeout: Duration) -> ProbeOutcome {
        tracing::debug!("Probing {} at {}", endpoint.name, endpoint.address());
        self.probe(endpoint, timeout).await.into()
    }
}

/// Parse the `server_version_num` setting
pub fn parse_server_version(value: Option<String>) -> Result<i64, ProbeError> {
    let value = value.ok_or(ProbeError::EmptyResult(QueryStage::Version))?;

    value.trim().parse::<i64>().map_err(|e| ProbeError::Parse {
        stage: QueryStage::Version,
        reason: format!("'{}' is not a version number: {}", value, e),
    })
}

/// Turn the position query's row into offsets
///
/// Both functions return NULL when the server is not in recovery, which is
/// what a probe of a primary looks like.
pub fn parse_position_row(
    row: Option<(Option<i64>, Option<i64>)>,
) -> Result<ReplicationPosition, ProbeError> {
    let (receive, replay) = row.ok_or(ProbeError::EmptyResult(QueryStage::Position))?;

    let receive_offset = offset("receive", receive)?;
    let replay_offset = offset("replay", replay)?;

    Ok(ReplicationPosition::new(receive_offset, replay_offset))
}

fn offset(column: &str, value: Option<i64>) -> Result<u64, ProbeError> {
    let value = value.ok_or_else(|| ProbeError::Parse {
        stage: QueryStage::Position,
        reason: format!("{} offset is NULL (server is not in recovery)", column),
    })?;

    u64::try_from(value).map_err(|_| ProbeError::Parse {
        stage: QueryStage::Position,
        reason: format!("{} offset is negative: {}", column, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Credentials;
    use crate::select::{Evaluator, SelectionResult, PROBE_TIMEOUT_SLACK};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Accept one connection and stop answering. With `authenticate`, the
    /// startup handshake completes first so the stall hits the first query.
    async fn stalled_server(authenticate: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            if authenticate {
                read_startup_message(&mut socket).await;
                // AuthenticationOk
                socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await.unwrap();
                // ReadyForQuery, idle
                socket.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await.unwrap();
            }

            let mut buf = [0u8; 1024];
            while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        addr
    }

    async fn read_startup_message(socket: &mut TcpStream) {
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize - 4];
        socket.read_exact(&mut body).await.unwrap();
    }

    fn local_endpoint(addr: SocketAddr) -> ReplicaEndpoint {
        ReplicaEndpoint::new(
            "stalled",
            "127.0.0.1",
            addr.port(),
            "postgres",
            Credentials::new("postgres", "postgres"),
        )
    }

    fn plain_reader() -> PgPositionReader {
        PgPositionReader::new(DialectResolver::default(), PgSslMode::Disable)
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version(Some("140005".to_string())).unwrap(), 140005);
        assert_eq!(parse_server_version(Some(" 90403\n".to_string())).unwrap(), 90403);

        assert_eq!(
            parse_server_version(None),
            Err(ProbeError::EmptyResult(QueryStage::Version))
        );

        let err = parse_server_version(Some("fourteen".to_string())).unwrap_err();
        assert!(matches!(err, ProbeError::Parse { stage: QueryStage::Version, .. }));
    }

    #[test]
    fn test_parse_position_row() {
        let position = parse_position_row(Some((Some(800), Some(790)))).unwrap();
        assert_eq!(position, ReplicationPosition::new(800, 790));
        assert!(position.is_consistent());

        assert_eq!(
            parse_position_row(None),
            Err(ProbeError::EmptyResult(QueryStage::Position))
        );
    }

    #[test]
    fn test_parse_position_row_rejects_null_and_negative() {
        let err = parse_position_row(Some((None, None))).unwrap_err();
        assert!(err.to_string().contains("not in recovery"));

        let err = parse_position_row(Some((Some(10), None))).unwrap_err();
        assert!(err.to_string().contains("replay"));

        let err = parse_position_row(Some((Some(-1), Some(0)))).unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[tokio::test]
    async fn test_unreachable_replica_is_a_connection_failure() {
        let reader = PgPositionReader::new(DialectResolver::default(), PgSslMode::Disable);
        // Port 1 on localhost refuses connections
        let endpoint = ReplicaEndpoint::new(
            "nowhere",
            "127.0.0.1",
            1,
            "postgres",
            Credentials::new("postgres", "postgres"),
        );

        let outcome = reader.read_position(&endpoint, Duration::from_secs(2)).await;
        let err = outcome.error().expect("probe should fail");
        assert_eq!(err.kind(), crate::error::ProbeErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_silent_server_is_a_connection_timeout() {
        let addr = stalled_server(false).await;
        let timeout = Duration::from_millis(300);

        let started = Instant::now();
        let outcome = plain_reader().read_position(&local_endpoint(addr), timeout).await;
        let elapsed = started.elapsed();

        assert_eq!(
            outcome.error(),
            Some(&ProbeError::ConnectionTimeout {
                address: addr.to_string(),
                timeout,
            })
        );
        assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_stalled_version_query_is_a_query_timeout() {
        let addr = stalled_server(true).await;
        let timeout = Duration::from_millis(300);

        let started = Instant::now();
        let outcome = plain_reader().read_position(&local_endpoint(addr), timeout).await;
        let elapsed = started.elapsed();

        assert_eq!(
            outcome.error(),
            Some(&ProbeError::QueryTimeout {
                stage: QueryStage::Version,
                timeout,
            })
        );
        assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
        assert!(elapsed < timeout + CLOSE_GRACE + Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_close_grace_fits_inside_evaluator_slack() {
        assert!(CLOSE_GRACE < PROBE_TIMEOUT_SLACK);
    }

    #[tokio::test]
    async fn test_evaluator_keeps_reader_query_timeout() {
        let addr = stalled_server(true).await;
        let timeout = Duration::from_millis(300);

        let evaluation = Evaluator::new(plain_reader())
            .select_candidate(&[local_endpoint(addr)], timeout)
            .await
            .unwrap();

        assert_eq!(evaluation.result, SelectionResult::NoCandidate);
        assert_eq!(
            evaluation.reports[0].outcome.error(),
            Some(&ProbeError::QueryTimeout {
                stage: QueryStage::Version,
                timeout,
            })
        );
    }
}
