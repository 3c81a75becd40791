use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::*;

use crate::common::*;
use crate::snapshot::{ClusterSnapshot, MemberInfo};
use crate::Error;

/// Decides which member should carry the master label and patches every
/// pod whose actual role differs. Returns whether anything was patched;
/// the caller ends the cycle on true so endpoint propagation finishes
/// before replication is configured against the new primary's DNS name.
pub async fn reconcile_roles(
    client: &Client,
    namespace: &str,
    snapshot: &ClusterSnapshot,
) -> Result<bool, Error> {
    let target_master = select_target_master(&snapshot.members)?.name().to_string();

    let pod_api = Api::<corev1::Pod>::namespaced(client.clone(), namespace);
    let mut patched = false;

    for member in &snapshot.members {
        let desired_role = if member.name() == target_master {
            ROLE_MASTER
        } else {
            ROLE_SLAVE
        };
        if member.role != desired_role {
            let patch = json!({"metadata": {"labels": {ROLE_LABEL: desired_role}}});
            pod_api
                .patch(member.name(), &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| Error::RoleLabelPatchFailed(member.name().to_string(), e))?;
            info!(
                "Patched role label on {}: {:?} -> {}",
                member.name(),
                member.role,
                desired_role
            );
            patched = true;
        }
    }

    Ok(patched)
}

/// Leader election over the ordered snapshot.
///
/// Candidates must be Kubernetes-ready and database-connectable; fewer
/// than two of those means the cluster cannot safely form a replicated
/// pair, reported as the distinguished InsufficientHealthyMembers error so
/// the top level can requeue on a short fixed interval.
///
/// A healthy incumbent is always kept, even when another member's GTID has
/// advanced past it; re-electing on GTID alone would make the primary
/// oscillate under transient partitions or replica lag.
pub fn select_target_master(members: &[MemberInfo]) -> Result<&MemberInfo, Error> {
    let current_masters: Vec<&MemberInfo> = members
        .iter()
        .filter(|member| member.role == ROLE_MASTER)
        .collect();
    let candidates: Vec<&MemberInfo> = members
        .iter()
        .filter(|member| member.is_ready && member.is_connectable)
        .collect();

    if candidates.len() < 2 {
        return Err(Error::InsufficientHealthyMembers);
    }

    match current_masters.as_slice() {
        [] => {
            info!("No current primary, electing");
            Ok(elect(&candidates))
        }
        [incumbent] => {
            if incumbent.is_ready && incumbent.is_connectable {
                Ok(*incumbent)
            } else {
                info!("Current primary {} is unhealthy, electing", incumbent.name());
                Ok(elect(&candidates))
            }
        }
        split => {
            warn!("{} members claim the master role, re-electing", split.len());
            Ok(elect(&candidates))
        }
    }
}

/// Scans candidates in snapshot order. A longer GTID string approximates a
/// larger executed set under the canonical encoding; equal lengths fall
/// back to lexicographic order, and a full tie keeps the earlier member,
/// which pins the result to the snapshot ordering.
fn elect<'a>(candidates: &[&'a MemberInfo]) -> &'a MemberInfo {
    let mut best = candidates[0];
    for &challenger in &candidates[1..] {
        if challenger.gtid.len() > best.gtid.len()
            || (challenger.gtid.len() == best.gtid.len() && challenger.gtid > best.gtid)
        {
            best = challenger;
        }
    }
    info!("Elected {} (gtid {:?})", best.name(), best.gtid);
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_helpers::member;

    #[test]
    fn too_few_candidates_is_reported_as_insufficient() {
        let members = vec![
            member("c-0", "", true, true, ""),
            member("c-1", "", true, false, ""),
            member("c-2", "", false, false, ""),
        ];
        assert!(matches!(
            select_target_master(&members),
            Err(Error::InsufficientHealthyMembers)
        ));
    }

    #[test]
    fn fresh_cluster_elects_first_member_on_empty_gtids() {
        let members = vec![
            member("c-0", "", true, true, ""),
            member("c-1", "", true, true, ""),
            member("c-2", "", true, true, ""),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-0");
    }

    #[test]
    fn longest_gtid_wins_an_election() {
        let members = vec![
            member("c-1", "", true, true, "uuid:1-100"),
            member("c-2", "", true, true, "uuid:1-99"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-1");
    }

    #[test]
    fn equal_length_gtids_compare_lexicographically() {
        let members = vec![
            member("c-0", "", true, true, "uuid:1-97"),
            member("c-1", "", true, true, "uuid:1-99"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-1");
    }

    #[test]
    fn full_tie_keeps_snapshot_order() {
        let members = vec![
            member("c-0", "", true, true, "uuid:1-99"),
            member("c-1", "", true, true, "uuid:1-99"),
            member("c-2", "", true, true, "uuid:1-99"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-0");
    }

    #[test]
    fn healthy_incumbent_is_kept_even_behind_on_gtid() {
        let members = vec![
            member("c-0", "master", true, true, "uuid:1-10"),
            member("c-1", "slave", true, true, "uuid:1-100"),
            member("c-2", "slave", true, true, "uuid:1-100"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-0");
    }

    #[test]
    fn unhealthy_incumbent_triggers_failover_by_gtid() {
        let members = vec![
            member("c-0", "master", false, false, ""),
            member("c-1", "slave", true, true, "uuid:1-100"),
            member("c-2", "slave", true, true, "uuid:1-99"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-1");
    }

    #[test]
    fn split_brain_forces_re_election() {
        let members = vec![
            member("c-0", "master", true, true, "uuid:1-50"),
            member("c-1", "master", true, true, "uuid:1-100"),
            member("c-2", "slave", true, true, "uuid:1-99"),
        ];
        let target = select_target_master(&members).unwrap();
        assert_eq!(target.name(), "c-1");
    }

    #[test]
    fn election_is_deterministic_over_identical_snapshots() {
        let build = || {
            vec![
                member("c-0", "", true, true, "uuid:1-88"),
                member("c-1", "", true, true, "uuid:1-88"),
                member("c-2", "", true, true, "uuid:1-87"),
            ]
        };
        let first = build();
        let second = build();
        assert_eq!(
            select_target_master(&first).unwrap().name(),
            select_target_master(&second).unwrap().name()
        );
    }

    #[test]
    fn repeat_cycles_never_move_a_healthy_primary() {
        // After the first election the winner carries the master label;
        // feeding the resulting state back in must keep the same target.
        let members = vec![
            member("c-1", "master", true, true, "uuid:1-50"),
            member("c-0", "slave", true, true, "uuid:1-500"),
            member("c-2", "slave", true, true, "uuid:1-500"),
        ];
        for _ in 0..3 {
            assert_eq!(select_target_master(&members).unwrap().name(), "c-1");
        }
    }
}
