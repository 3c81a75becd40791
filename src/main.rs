pub mod common;
pub mod configmap;
pub mod credentials;
pub mod db;
pub mod election;
pub mod gtid;
pub mod mysqlcluster_types;
pub mod replication;
pub mod service;
pub mod snapshot;
pub mod statefulset;
pub mod status;
pub mod users;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    runtime::controller::{Action, Controller},
    runtime::reflector::ObjectRef,
    Client, CustomResourceExt,
};
use serde_json::json;
use std::{env, sync::Arc};
use thiserror::Error as ThisError;
use tokio::time::Duration;
use tracing::*;

use crate::common::*;
use crate::db::DbError;
use crate::mysqlcluster_types::*;
use crate::snapshot::ClusterSnapshot;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to get MysqlCluster: {0}")]
    CRGetFailed(#[source] kube::Error),
    #[error("Failed to update MysqlCluster status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),

    #[error("Required secret '{0}' not found; create it with the 'root-password' and 'repl-password' keys")]
    SecretMissing(String),
    #[error("Secret '{0}' exists but is missing the required key '{1}'")]
    SecretKeyMissing(String, &'static str),
    #[error("Failed to get secret: {0}")]
    SecretGetFailed(#[source] kube::Error),

    #[error("Failed to reconcile Service: {0}")]
    ReconcileServiceFailed(#[source] kube::Error),
    #[error("Failed to reconcile ConfigMap: {0}")]
    ReconcileConfigMapFailed(#[source] kube::Error),
    #[error("Failed to reconcile StatefulSet: {0}")]
    ReconcileStatefulSetFailed(#[source] kube::Error),
    #[error("Failed to list member pods: {0}")]
    PodListFailed(#[source] kube::Error),
    #[error("Failed to patch role label on {0}: {1}")]
    RoleLabelPatchFailed(String, #[source] kube::Error),

    #[error("Database user reconciliation failed on {0}: {1}")]
    UserReconcileFailed(String, #[source] DbError),
    #[error("Some members did not answer the GTID probe: {0}")]
    GtidProbeFailed(String),
    #[error("Replication configuration failed on {0}: {1}")]
    ReplicationConfigFailed(String, #[source] DbError),
    #[error("No member carries the master role label")]
    NoMasterLabeled,

    // Distinguished condition, not a failure: fewer than two members are
    // healthy enough to form a replicated pair. The reconcile fn converts
    // it into a short fixed requeue instead of routing it through
    // error_policy, since the usual cause is a pending image pull.
    #[error("Not enough healthy members to form a replicated cluster")]
    InsufficientHealthyMembers,

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

// Data we want access to in error/reconcile calls
struct Data {
    client: Client,
}

async fn ensure_service(cluster: &MysqlCluster, client: &Client, role: &str) -> Result<(), Error> {
    let svc_api = Api::<corev1::Service>::namespaced(
        client.clone(),
        cluster.metadata.namespace.as_ref().unwrap(),
    );
    let svc = service::service_build(cluster, role);
    let svc_name = svc.metadata.name.as_ref().unwrap();

    if svc_api
        .get_opt(svc_name)
        .await
        .map_err(Error::ReconcileServiceFailed)?
        .is_some()
    {
        // Services are never updated after creation; their selectors and
        // ports are fixed by construction.
        return Ok(());
    }

    info!("Create service: {}", svc_name);
    match svc_api.create(&PostParams::default(), &svc).await {
        Err(kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. }))
            if reason == "AlreadyExists" =>
        {
            Ok(())
        }
        Err(e) => Err(Error::ReconcileServiceFailed(e)),
        Ok(_) => Ok(()),
    }
}

/// Ensures the config bundle exists and matches the desired content, and
/// returns the digest of that content for the pod template annotation.
async fn ensure_config_map(cluster: &MysqlCluster, client: &Client) -> Result<String, Error> {
    let cm_api = Api::<corev1::ConfigMap>::namespaced(
        client.clone(),
        cluster.metadata.namespace.as_ref().unwrap(),
    );
    let cm = configmap::configmap_build(cluster);
    let cm_name = cm.metadata.name.as_ref().unwrap();
    let config_hash = configmap::config_data_hash(cm.data.as_ref().unwrap());

    let cm_o = cm_api
        .get_opt(cm_name)
        .await
        .map_err(Error::ReconcileConfigMapFailed)?;

    match cm_o {
        Some(existing) => {
            if existing.data != cm.data {
                info!("Update configmap: {}", cm_name);
                let updated_cm = corev1::ConfigMap {
                    data: cm.data,
                    ..existing
                };
                cm_api
                    .replace(cm_name, &PostParams::default(), &updated_cm)
                    .await
                    .map_err(Error::ReconcileConfigMapFailed)?;
            }
        }
        None => {
            info!("Create configmap: {}", cm_name);
            cm_api
                .create(&PostParams::default(), &cm)
                .await
                .map_err(Error::ReconcileConfigMapFailed)?;
        }
    }

    Ok(config_hash)
}

async fn ensure_stateful_set(
    cluster: &MysqlCluster,
    client: &Client,
    config_hash: &str,
) -> Result<(), Error> {
    let sts_api = Api::<appsv1::StatefulSet>::namespaced(
        client.clone(),
        cluster.metadata.namespace.as_ref().unwrap(),
    );
    let sts = statefulset::statefulset_build(cluster, config_hash);
    let sts_name = sts.metadata.name.as_ref().unwrap();

    let sts_o = sts_api
        .get_opt(sts_name)
        .await
        .map_err(Error::ReconcileStatefulSetFailed)?;

    match sts_o {
        Some(existing) => {
            if let Some(updated_sts) =
                statefulset::apply_update_policy(&existing, cluster.desired_replicas(), config_hash)
            {
                info!("Update statefulset: {}", sts_name);
                sts_api
                    .replace(sts_name, &PostParams::default(), &updated_sts)
                    .await
                    .map_err(Error::ReconcileStatefulSetFailed)?;
            }
            Ok(())
        }
        None => {
            info!("Create statefulset: {}", sts_name);
            sts_api
                .create(&PostParams::default(), &sts)
                .await
                .map_err(Error::ReconcileStatefulSetFailed)?;
            Ok(())
        }
    }
}

async fn ensure_infrastructure(cluster: &MysqlCluster, client: &Client) -> Result<(), Error> {
    for role in ["master", "slave", "headless"] {
        ensure_service(cluster, client, role).await?;
    }
    let config_hash = ensure_config_map(cluster, client).await?;
    ensure_stateful_set(cluster, client, &config_hash).await?;
    Ok(())
}

/// Controller triggers this whenever the cluster object, one of its owned
/// objects, or one of its member pods changed.
async fn reconcile(cluster_from_cache: Arc<MysqlCluster>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = cluster_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = cluster_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let cluster_api = Api::<MysqlCluster>::namespaced(client.clone(), namespace);

    // Re-read the cluster before acting; a cached object may be stale.
    let cluster = match cluster_api.get_opt(name).await.map_err(Error::CRGetFailed)? {
        Some(cluster) => cluster,
        None => {
            info!("{} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
    };

    // First touch: surface engagement immediately, before the (slow)
    // infrastructure work. The status write re-triggers the reconcile.
    if cluster.status.as_ref().and_then(|s| s.phase.as_ref()).is_none() {
        cluster_api
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"status": {"phase": MysqlClusterPhase::Initializing}})),
            )
            .await
            .map_err(Error::StatusUpdateFailed)?;
        info!("{} entering Initializing", name);
        return Ok(Action::await_change());
    }

    let (root_password, repl_password) = credentials::read_credentials(client, &cluster).await?;
    let mut snapshot = ClusterSnapshot {
        root_password,
        repl_password,
        members: Vec::new(),
    };

    ensure_infrastructure(&cluster, client).await?;

    snapshot::update_snapshot_with_pods(client, &cluster, &mut snapshot).await?;

    users::ensure_database_users(&snapshot).await?;

    if let Err(e) = gtid::update_snapshot_with_gtids(&mut snapshot).await {
        // Partial reachability is expected during rolling restarts; the
        // unreachable members simply stay non-candidates this cycle.
        info!("{}", e);
    }

    match election::reconcile_roles(client, namespace, &snapshot).await {
        Err(Error::InsufficientHealthyMembers) => {
            if let Err(e) = status::update_status(&cluster_api, &cluster, &snapshot).await {
                error!("Status update failed: {}", e);
            }
            info!("Fewer than two healthy members, waiting for pods");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        Err(e) => return Err(e),
        Ok(true) => {
            // Surface the new roles right away, then let endpoint
            // propagation finish before any replica is pointed at the new
            // primary by DNS. The label patches re-trigger the reconcile
            // through the pod watch.
            if let Err(e) = status::update_status(&cluster_api, &cluster, &snapshot).await {
                error!("Status update failed: {}", e);
            }
            info!("Role labels changed, deferring replication configuration");
            return Ok(Action::await_change());
        }
        Ok(false) => {}
    }

    replication::reconcile_replication(&cluster, &snapshot).await?;

    status::update_status(&cluster_api, &cluster, &snapshot).await?;

    // Periodic resync as a self-healing backstop.
    Ok(Action::requeue(Duration::from_secs(60)))
}

/// The controller triggers this on reconcile errors.
fn error_policy(error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    match error {
        // User action required; hammering the API will not fix a missing
        // secret.
        Error::SecretMissing(_) | Error::SecretKeyMissing(..) => {
            Action::requeue(Duration::from_secs(30))
        }
        _ => Action::requeue(Duration::from_secs(10)),
    }
}

/// Maps a member pod event back to its owning cluster through the app
/// label. Pods without the label are not ours and enqueue nothing, which
/// keeps clusters in the same namespace isolated from each other.
fn cluster_for_pod(pod: corev1::Pod) -> Option<ObjectRef<MysqlCluster>> {
    let labels = pod.metadata.labels.as_ref()?;
    let cluster_name = labels.get(APP_LABEL)?;
    let namespace = pod.metadata.namespace.as_ref()?;
    Some(ObjectRef::new(cluster_name).within(namespace))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_else(|| "run".to_string());
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&MysqlCluster::crd())?);
    } else if cmd == "run" {
        info!("running mysql-cluster-controller");
        let client = Client::try_default().await?;
        let clusters = Api::<MysqlCluster>::all(client.clone());

        Controller::new(clusters, ListParams::default())
            .owns(
                Api::<appsv1::StatefulSet>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<corev1::Service>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<corev1::ConfigMap>::all(client.clone()),
                ListParams::default(),
            )
            // Safety net: a hand-edited role label never shows up as a
            // StatefulSet change, only as a pod change.
            .watches(
                Api::<corev1::Pod>::all(client.clone()),
                ListParams::default(),
                cluster_for_pod,
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(Data { client }))
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
