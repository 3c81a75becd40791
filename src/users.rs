use futures::future::join_all;
use mysql_async::prelude::Queryable;
use tracing::*;

use crate::common::REPL_USER;
use crate::db::{self, DbError, STATEMENT_TIMEOUT};
use crate::snapshot::{ClusterSnapshot, MemberInfo};
use crate::Error;

/// Converges the root and replication accounts on every ready member, in
/// parallel. Each statement is idempotent, so a retried cycle redoes the
/// whole sequence safely. Every member runs to completion; the first
/// collected failure is returned afterwards.
pub async fn ensure_database_users(snapshot: &ClusterSnapshot) -> Result<(), Error> {
    let results = join_all(
        snapshot
            .members
            .iter()
            .filter(|member| member.is_ready)
            .map(|member| async move {
                ensure_users_on_member(member, &snapshot.root_password, &snapshot.repl_password)
                    .await
                    .map_err(|e| Error::UserReconcileFailed(member.name().to_string(), e))
            }),
    )
    .await;

    for result in results {
        result?;
    }
    Ok(())
}

async fn ensure_users_on_member(
    member: &MemberInfo,
    root_password: &str,
    repl_password: &str,
) -> Result<(), DbError> {
    let ip = member.pod_ip().ok_or(DbError::NoPodIp)?;
    let mut conn = db::connect_root(ip, root_password).await?;

    // Account maintenance must not enter the binlog: a replica that joins
    // later has to start from an empty executed-GTID set, and these writes
    // would otherwise poison it.
    db::run(
        STATEMENT_TIMEOUT,
        conn.query_drop("SET SESSION sql_log_bin = 0"),
    )
    .await?;

    db::run(
        STATEMENT_TIMEOUT,
        conn.exec_drop(
            format!("CREATE USER IF NOT EXISTS '{REPL_USER}'@'%' IDENTIFIED BY ?"),
            (repl_password,),
        ),
    )
    .await?;

    // Unconditional reset keeps existing members in step after a rotation.
    db::run(
        STATEMENT_TIMEOUT,
        conn.exec_drop(
            format!("ALTER USER '{REPL_USER}'@'%' IDENTIFIED BY ?"),
            (repl_password,),
        ),
    )
    .await?;

    db::run(
        STATEMENT_TIMEOUT,
        conn.query_drop(format!(
            "GRANT REPLICATION SLAVE ON *.* TO '{REPL_USER}'@'%'"
        )),
    )
    .await?;

    db::run(
        STATEMENT_TIMEOUT,
        conn.exec_drop("ALTER USER 'root'@'%' IDENTIFIED BY ?", (root_password,)),
    )
    .await?;

    db::run(STATEMENT_TIMEOUT, conn.query_drop("FLUSH PRIVILEGES")).await?;

    debug!("Database users converged on {}", member.name());
    let _ = conn.disconnect().await;
    Ok(())
}
