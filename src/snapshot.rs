use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::*;

use crate::common::*;
use crate::mysqlcluster_types::*;
use crate::Error;

/// One member pod as observed this cycle. `gtid` and `is_connectable` are
/// filled in by the prober after the list is built.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub pod: corev1::Pod,
    pub role: String,
    pub is_ready: bool,
    pub is_connectable: bool,
    pub gtid: String,
}

impl MemberInfo {
    pub fn name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn pod_ip(&self) -> Option<&str> {
        self.pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
    }
}

/// Ephemeral per-cycle view of the cluster: the two passwords plus the
/// ordered member list. Rebuilt from observation every cycle, never stored.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    pub root_password: String,
    pub repl_password: String,
    pub members: Vec<MemberInfo>,
}

/// Lists the member pods and fills the snapshot in lexicographic name
/// order. Every election tie-break downstream leans on this ordering.
pub async fn update_snapshot_with_pods(
    client: &Client,
    cluster: &MysqlCluster,
    snapshot: &mut ClusterSnapshot,
) -> Result<(), Error> {
    let namespace = cluster.metadata.namespace.as_ref().unwrap();
    let cluster_name = cluster.metadata.name.as_ref().unwrap();

    let pod_api = Api::<corev1::Pod>::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}={}", APP_LABEL, cluster_name));
    let pod_list = pod_api.list(&lp).await.map_err(Error::PodListFailed)?;

    let mut pods = pod_list.items;
    pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    snapshot.members = pods.into_iter().map(member_from_pod).collect();
    debug!("Snapshot holds {} member pods", snapshot.members.len());
    Ok(())
}

fn member_from_pod(pod: corev1::Pod) -> MemberInfo {
    let role = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ROLE_LABEL))
        .cloned()
        .unwrap_or_default();
    let is_ready = pod_is_ready(&pod);
    MemberInfo {
        pod,
        role,
        is_ready,
        is_connectable: false,
        gtid: String::new(),
    }
}

/// Kubernetes-level readiness. A pod with a deletion timestamp may still
/// report Running and Ready; treating it as not-ready lets failover start
/// before the pod actually disappears.
pub fn pod_is_ready(pod: &corev1::Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
