use mysql_async::{Conn, Opts, OptsBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

// Connection establishment is kept short so one dead member cannot stall
// a fan-out for long; statement deadlines are looser.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(3);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("statement timed out")]
    StatementTimeout,
    #[error("pod has no ip assigned yet")]
    NoPodIp,
    #[error(transparent)]
    Sql(#[from] mysql_async::Error),
}

/// Opens a root session against one member, bounded by the connect
/// deadline. The connection dies with the cycle; nothing is pooled.
pub async fn connect_root(host: &str, root_password: &str) -> Result<Conn, DbError> {
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(3306)
        .user(Some("root"))
        .pass(Some(root_password))
        .db_name(Some("mysql"))
        .into();
    match timeout(CONNECT_TIMEOUT, Conn::new(opts)).await {
        Ok(conn) => Ok(conn?),
        Err(_) => Err(DbError::ConnectTimeout(host.to_string())),
    }
}

/// Runs one driver operation under a deadline.
pub async fn run<T, F>(deadline: Duration, fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, mysql_async::Error>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DbError::StatementTimeout),
    }
}
