use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::*;

use crate::common::*;
use crate::mysqlcluster_types::*;
use crate::snapshot::ClusterSnapshot;
use crate::Error;

/// Derives the aggregate status from the snapshot and writes it through
/// the status subresource, but only when it actually differs from what is
/// observed; unconditional writes would storm the API server and conflict
/// with spec-side edits.
pub async fn update_status(
    cluster_api: &Api<MysqlCluster>,
    cluster: &MysqlCluster,
    snapshot: &ClusterSnapshot,
) -> Result<(), Error> {
    let new_status = build_status(cluster, snapshot);
    if cluster.status.as_ref() == Some(&new_status) {
        return Ok(());
    }

    let name = cluster.metadata.name.as_ref().unwrap();
    cluster_api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": new_status })),
        )
        .await
        .map_err(Error::StatusUpdateFailed)?;
    info!(
        "Status updated: phase {:?}, master {:?}",
        new_status.phase, new_status.current_master
    );
    Ok(())
}

pub fn build_status(cluster: &MysqlCluster, snapshot: &ClusterSnapshot) -> MysqlClusterStatus {
    let mut master_count: i32 = 0;
    let mut slave_count: i32 = 0;
    let mut current_master = String::new();
    let mut members = Vec::with_capacity(snapshot.members.len());

    for member in &snapshot.members {
        if member.is_connectable && member.role == ROLE_MASTER {
            master_count += 1;
            current_master = member.name().to_string();
        }
        if member.is_connectable && member.role == ROLE_SLAVE {
            slave_count += 1;
        }
        members.push(MemberStatus {
            name: member.name().to_string(),
            role: member.role.clone(),
            is_ready: member.is_ready,
            is_connectable: member.is_connectable,
        });
    }

    let desired = cluster.desired_replicas();
    let phase = derive_phase(
        cluster.metadata.deletion_timestamp.is_some(),
        cluster.status.as_ref().and_then(|s| s.phase.as_ref()),
        master_count,
        slave_count,
        desired,
        snapshot.members.len(),
    );

    MysqlClusterStatus {
        phase: Some(phase),
        master_replicas: master_count,
        slave_replicas: slave_count,
        master_display: format!("{}/1", master_count),
        slave_display: format!("{}/{}", slave_count, desired - 1),
        current_master,
        members: Some(members),
        // Conditions are not managed yet; whatever is there is carried.
        conditions: cluster.status.as_ref().and_then(|s| s.conditions.clone()),
    }
}

/// Phase derivation is history-dependent: once the cluster has reached
/// Running/Degraded/Failed it stays in that family (the bootstrapped
/// latch), so a transient startup failure is never reported as Failed and
/// a converged cluster never falls back to Pending.
fn derive_phase(
    deleting: bool,
    previous_phase: Option<&MysqlClusterPhase>,
    master_count: i32,
    slave_count: i32,
    desired_replicas: i32,
    member_count: usize,
) -> MysqlClusterPhase {
    use MysqlClusterPhase::*;

    if deleting {
        return Terminating;
    }

    let bootstrapped = matches!(previous_phase, Some(Running) | Some(Degraded) | Some(Failed));
    if bootstrapped {
        if master_count == 0 {
            Failed
        } else if slave_count < desired_replicas - 1 {
            Degraded
        } else {
            Running
        }
    } else if master_count >= 1 && slave_count >= 1 {
        // First time both roles are live: the cluster enters the
        // bootstrapped family through Degraded.
        Degraded
    } else if member_count == 0 {
        Initializing
    } else {
        Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_helpers::member;
    use serde_json::json;
    use MysqlClusterPhase::*;

    fn cluster_with_phase(phase: Option<MysqlClusterPhase>) -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "demo",
            serde_json::from_value(json!({
                "image": "mysql:8.0",
                "replicas": 3,
                "storage": {"size": "1Gi"},
                "resources": {},
                "secretName": {"name": "demo-secret"},
            }))
            .unwrap(),
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.status = Some(MysqlClusterStatus {
            phase,
            ..MysqlClusterStatus::default()
        });
        cluster
    }

    fn snapshot(members: Vec<crate::snapshot::MemberInfo>) -> ClusterSnapshot {
        ClusterSnapshot {
            root_password: "root".into(),
            repl_password: "repl".into(),
            members,
        }
    }

    #[test]
    fn counts_only_connectable_members() {
        let cluster = cluster_with_phase(Some(Running));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "master", true, true, ""),
                member("c-1", "slave", true, true, ""),
                member("c-2", "slave", true, false, ""),
            ]),
        );
        assert_eq!(status.master_replicas, 1);
        assert_eq!(status.slave_replicas, 1);
        assert_eq!(status.current_master, "c-0");
        assert_eq!(status.master_display, "1/1");
        assert_eq!(status.slave_display, "1/2");
    }

    #[test]
    fn bootstrapped_cluster_without_master_is_failed() {
        let cluster = cluster_with_phase(Some(Running));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "master", false, false, ""),
                member("c-1", "slave", true, true, ""),
                member("c-2", "slave", true, true, ""),
            ]),
        );
        assert_eq!(status.phase, Some(Failed));
    }

    #[test]
    fn bootstrapped_cluster_missing_replicas_is_degraded() {
        let cluster = cluster_with_phase(Some(Running));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "master", true, true, ""),
                member("c-1", "slave", true, true, ""),
                member("c-2", "slave", true, false, ""),
            ]),
        );
        assert_eq!(status.phase, Some(Degraded));
    }

    #[test]
    fn bootstrapped_cluster_fully_replicated_is_running() {
        let cluster = cluster_with_phase(Some(Degraded));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "master", true, true, ""),
                member("c-1", "slave", true, true, ""),
                member("c-2", "slave", true, true, ""),
            ]),
        );
        assert_eq!(status.phase, Some(Running));
    }

    #[test]
    fn startup_with_both_roles_promotes_to_degraded() {
        let cluster = cluster_with_phase(Some(Pending));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "master", true, true, ""),
                member("c-1", "slave", true, true, ""),
            ]),
        );
        assert_eq!(status.phase, Some(Degraded));
    }

    #[test]
    fn startup_with_no_pods_is_initializing() {
        let cluster = cluster_with_phase(Some(Initializing));
        let status = build_status(&cluster, &snapshot(vec![]));
        assert_eq!(status.phase, Some(Initializing));
    }

    #[test]
    fn startup_with_unrolled_pods_is_pending() {
        let cluster = cluster_with_phase(Some(Initializing));
        let status = build_status(
            &cluster,
            &snapshot(vec![
                member("c-0", "", true, false, ""),
                member("c-1", "", false, false, ""),
            ]),
        );
        assert_eq!(status.phase, Some(Pending));
    }

    #[test]
    fn deleting_cluster_is_terminating() {
        let mut cluster = cluster_with_phase(Some(Running));
        let deleted_at = serde_json::from_str("\"2024-01-01T00:00:00Z\"").unwrap();
        cluster.metadata.deletion_timestamp = Some(deleted_at);
        let status = build_status(&cluster, &snapshot(vec![]));
        assert_eq!(status.phase, Some(Terminating));
    }

    #[test]
    fn bootstrapped_phase_never_reverts_to_startup_phases() {
        // Even a total outage maps to Failed, not Pending or Initializing.
        for previous in [Running, Degraded, Failed] {
            let cluster = cluster_with_phase(Some(previous));
            let status = build_status(&cluster, &snapshot(vec![]));
            assert!(matches!(status.phase, Some(Failed)));
        }
    }

    #[test]
    fn no_write_when_status_is_unchanged() {
        let cluster = cluster_with_phase(Some(Running));
        let snap = snapshot(vec![
            member("c-0", "master", true, true, ""),
            member("c-1", "slave", true, true, ""),
            member("c-2", "slave", true, true, ""),
        ]);
        let first = build_status(&cluster, &snap);
        let mut cluster_after = cluster.clone();
        cluster_after.status = Some(first.clone());
        let second = build_status(&cluster_after, &snap);
        // The deep-equality gate in update_status sees these as equal.
        assert_eq!(first, second);
    }
}
