use futures::future::join_all;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row};
use tracing::*;

use crate::common::*;
use crate::db::{self, DbError, STATEMENT_TIMEOUT};
use crate::mysqlcluster_types::*;
use crate::snapshot::{ClusterSnapshot, MemberInfo};
use crate::Error;

/// Converges the MySQL-level replication topology onto the declared role
/// labels: read_only flags, replication source, thread state. Runs one
/// session per connectable member in parallel; every member finishes and
/// the first collected error is returned.
pub async fn reconcile_replication(
    cluster: &MysqlCluster,
    snapshot: &ClusterSnapshot,
) -> Result<(), Error> {
    let master = snapshot
        .members
        .iter()
        .find(|member| member.role == ROLE_MASTER)
        .ok_or(Error::NoMasterLabeled)?;
    let master_host = pod_headless_fqdn(cluster, master.name());

    let results = join_all(
        snapshot
            .members
            .iter()
            .filter(|member| member.is_connectable)
            .map(|member| {
                let master_host = &master_host;
                async move {
                    configure_member(member, master_host, snapshot)
                        .await
                        .map_err(|e| Error::ReplicationConfigFailed(member.name().to_string(), e))
                }
            }),
    )
    .await;

    for result in results {
        result?;
    }
    Ok(())
}

async fn configure_member(
    member: &MemberInfo,
    master_host: &str,
    snapshot: &ClusterSnapshot,
) -> Result<(), DbError> {
    let ip = member.pod_ip().ok_or(DbError::NoPodIp)?;
    let mut conn = db::connect_root(ip, &snapshot.root_password).await?;
    db::run(STATEMENT_TIMEOUT, conn.ping()).await?;

    match member.role.as_str() {
        ROLE_MASTER => configure_master(&mut conn, member.name()).await?,
        ROLE_SLAVE => {
            configure_replica(
                &mut conn,
                member.name(),
                master_host,
                &snapshot.repl_password,
            )
            .await?
        }
        _ => {}
    }

    let _ = conn.disconnect().await;
    Ok(())
}

async fn configure_master(conn: &mut Conn, pod_name: &str) -> Result<(), DbError> {
    db::run(STATEMENT_TIMEOUT, conn.query_drop("SET GLOBAL read_only=0")).await?;

    // A promoted replica may still have a replication thread; stop errors
    // are ignored since there may be nothing to stop.
    let _ = db::run(STATEMENT_TIMEOUT, conn.query_drop("STOP SLAVE")).await;

    // Clear any prior source so a former replica does not keep pulling
    // from the old primary.
    db::run(STATEMENT_TIMEOUT, conn.query_drop("RESET SLAVE ALL")).await?;

    debug!("Configured {} as primary", pod_name);
    Ok(())
}

async fn configure_replica(
    conn: &mut Conn,
    pod_name: &str,
    master_host: &str,
    repl_password: &str,
) -> Result<(), DbError> {
    db::run(STATEMENT_TIMEOUT, conn.query_drop("SET GLOBAL read_only=1")).await?;

    if replica_is_converged(conn, master_host).await? {
        return Ok(());
    }

    db::run(STATEMENT_TIMEOUT, conn.query_drop("STOP SLAVE")).await?;
    db::run(STATEMENT_TIMEOUT, conn.query_drop("RESET SLAVE ALL")).await?;

    // No RESET MASTER here: the user reconciler disables binlogging for
    // its session, so a fresh member's executed set is already empty when
    // it first joins. Auto-position then pulls the full history.
    let change_master = format!(
        "CHANGE MASTER TO MASTER_HOST='{master_host}', MASTER_USER='{REPL_USER}', \
         MASTER_PASSWORD=?, MASTER_PORT=3306, MASTER_CONNECT_RETRY=10, MASTER_AUTO_POSITION=1"
    );
    db::run(STATEMENT_TIMEOUT, conn.exec_drop(change_master, (repl_password,))).await?;

    db::run(STATEMENT_TIMEOUT, conn.query_drop("START SLAVE")).await?;

    info!("Pointed replica {} at {}", pod_name, master_host);
    Ok(())
}

/// A replica already replicating from the target primary with both threads
/// running needs no reconfiguration.
async fn replica_is_converged(conn: &mut Conn, master_host: &str) -> Result<bool, DbError> {
    let row: Option<Row> = db::run(STATEMENT_TIMEOUT, conn.query_first("SHOW SLAVE STATUS")).await?;
    let row = match row {
        Some(row) => row,
        // No row at all: replication has never been configured.
        None => return Ok(false),
    };

    let io_running: Option<String> = row.get_opt("Slave_IO_Running").and_then(Result::ok);
    let sql_running: Option<String> = row.get_opt("Slave_SQL_Running").and_then(Result::ok);
    let current_master: Option<String> = row.get_opt("Master_Host").and_then(Result::ok);

    Ok(slave_status_converged(
        io_running.as_deref(),
        sql_running.as_deref(),
        current_master.as_deref(),
        master_host,
    ))
}

fn slave_status_converged(
    io_running: Option<&str>,
    sql_running: Option<&str>,
    current_master: Option<&str>,
    target_master: &str,
) -> bool {
    io_running.map_or(false, |v| v.eq_ignore_ascii_case("Yes"))
        && sql_running.map_or(false, |v| v.eq_ignore_ascii_case("Yes"))
        && current_master == Some(target_master)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "c-0.demo-svc-headless.default";

    #[test]
    fn converged_replica_is_left_alone() {
        assert!(slave_status_converged(
            Some("Yes"),
            Some("Yes"),
            Some(TARGET),
            TARGET
        ));
        // Thread states compare case-insensitively.
        assert!(slave_status_converged(
            Some("yes"),
            Some("YES"),
            Some(TARGET),
            TARGET
        ));
    }

    #[test]
    fn stopped_threads_force_reconfiguration() {
        assert!(!slave_status_converged(
            Some("No"),
            Some("Yes"),
            Some(TARGET),
            TARGET
        ));
        assert!(!slave_status_converged(
            Some("Yes"),
            Some("Connecting"),
            Some(TARGET),
            TARGET
        ));
    }

    #[test]
    fn wrong_master_host_forces_reconfiguration() {
        assert!(!slave_status_converged(
            Some("Yes"),
            Some("Yes"),
            Some("c-1.demo-svc-headless.default"),
            TARGET
        ));
    }

    #[test]
    fn missing_columns_force_reconfiguration() {
        assert!(!slave_status_converged(None, None, None, TARGET));
    }
}
