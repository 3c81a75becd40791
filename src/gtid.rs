use futures::future::join_all;
use mysql_async::prelude::Queryable;
use tracing::*;

use crate::db::{self, DbError, PROBE_TIMEOUT};
use crate::snapshot::{ClusterSnapshot, MemberInfo};
use crate::Error;

/// Probes every ready member in parallel: ping, then read the executed
/// GTID set. Success marks the member connectable; failure only clears the
/// flag. The caller logs the joined error and carries on, since partial
/// reachability is the normal state during a rolling restart and the
/// stages downstream act on whichever subset responded.
pub async fn update_snapshot_with_gtids(snapshot: &mut ClusterSnapshot) -> Result<(), Error> {
    let root_password = snapshot.root_password.clone();

    let failures: Vec<String> = join_all(
        snapshot
            .members
            .iter_mut()
            .filter(|member| member.is_ready)
            .map(|member| {
                let root_password = &root_password;
                async move {
                    match query_member_gtid(member, root_password).await {
                        Ok(gtid) => {
                            member.is_connectable = true;
                            member.gtid = gtid;
                            None
                        }
                        Err(e) => {
                            member.is_connectable = false;
                            Some(format!("{}: {}", member.name(), e))
                        }
                    }
                }
            }),
    )
    .await
    .into_iter()
    .flatten()
    .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::GtidProbeFailed(failures.join("; ")))
    }
}

async fn query_member_gtid(member: &MemberInfo, root_password: &str) -> Result<String, DbError> {
    let ip = member.pod_ip().ok_or(DbError::NoPodIp)?;
    let mut conn = db::connect_root(ip, root_password).await?;

    db::run(PROBE_TIMEOUT, conn.ping()).await?;

    let gtid: Option<String> = db::run(
        PROBE_TIMEOUT,
        conn.query_first("SELECT @@global.gtid_executed"),
    )
    .await?;

    debug!("Executed GTID set on {}: {:?}", member.name(), gtid);
    let _ = conn.disconnect().await;
    // A freshly initialized server reports an empty set.
    Ok(gtid.unwrap_or_default())
}
