//! Continuous write probe against the master service of a cluster.
//!
//! Inserts a monotonically increasing sequence number once per second and
//! logs latency and the serving host. Sequence numbers advance on failure
//! too, so a replication failover shows up as a visible gap.

use anyhow::Result;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::env;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::*;

const PROBE_DB: &str = "probe";
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(1);

fn opts(host: &str, password: &str, db_name: Option<&str>) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(3306)
        .user(Some("root"))
        .pass(Some(password))
        .db_name(db_name)
        .into()
}

async fn connect(host: &str, password: &str, db_name: Option<&str>) -> Result<Conn> {
    let conn = timeout(Duration::from_secs(2), Conn::new(opts(host, password, db_name))).await??;
    Ok(conn)
}

/// Blocks until the probe database and heartbeat table exist.
async fn wait_for_schema(host: &str, password: &str) {
    loop {
        match bootstrap_schema(host, password).await {
            Ok(()) => {
                info!("heartbeat table is ready");
                return;
            }
            Err(e) => {
                info!("waiting for the master service: {}", e);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn bootstrap_schema(host: &str, password: &str) -> Result<()> {
    let mut conn = connect(host, password, Some("mysql")).await?;
    conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS {}", PROBE_DB))
        .await?;
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS {}.heartbeat (
            id INT AUTO_INCREMENT PRIMARY KEY,
            seq_no INT NOT NULL,
            write_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            host VARCHAR(64)
        )",
        PROBE_DB
    ))
    .await?;
    conn.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let host = env::var("PROBE_MASTER_HOST")
        .unwrap_or_else(|_| "test-cluster-svc-master.default".to_string());
    let password = env::var("PROBE_ROOT_PASSWORD").unwrap_or_else(|_| "root".to_string());

    info!("write probe targeting {}:3306", host);
    wait_for_schema(&host, &password).await;

    let mut conn = connect(&host, &password, Some(PROBE_DB)).await?;

    // Resume after the highest sequence already present so restarts do not
    // reset the series.
    let mut seq_no: i32 = conn
        .query_first("SELECT IFNULL(MAX(seq_no), 0) FROM heartbeat")
        .await?
        .unwrap_or(0);
    seq_no += 1;
    info!("starting continuous writes at seq {}", seq_no);

    loop {
        let started = Instant::now();
        let result = timeout(STATEMENT_TIMEOUT, async {
            let serving_host: Option<String> = conn.query_first("SELECT @@hostname").await?;
            conn.exec_drop(
                "INSERT INTO heartbeat (seq_no, host) VALUES (?, ?)",
                (seq_no, serving_host.clone().unwrap_or_default()),
            )
            .await?;
            Ok::<_, mysql_async::Error>(serving_host)
        })
        .await;

        let elapsed = started.elapsed();
        match result {
            Ok(Ok(serving_host)) => {
                info!(
                    "seq {} written in {:?} via {}",
                    seq_no,
                    elapsed,
                    serving_host.unwrap_or_default()
                );
            }
            Ok(Err(e)) => {
                warn!("seq {} lost after {:?}: {}", seq_no, elapsed, e);
                // The session may be broken; reconnect before the next tick.
                if let Ok(fresh) = connect(&host, &password, Some(PROBE_DB)).await {
                    conn = fresh;
                }
            }
            Err(_) => {
                warn!("seq {} timed out after {:?}", seq_no, elapsed);
                if let Ok(fresh) = connect(&host, &password, Some(PROBE_DB)).await {
                    conn = fresh;
                }
            }
        }

        // Gaps in the stored sequence mark the failover window.
        seq_no += 1;
        sleep(Duration::from_secs(1)).await;
    }
}
