use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REPLICAS: i32 = 3;

/// Reference to the user-provided Secret carrying the two password keys
/// `root-password` and `repl-password`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub size: Quantity,
    // None falls back to the default StorageClass of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "db.ferrite.dev", version = "v1", kind = "MysqlCluster")]
#[kube(shortname = "mc", namespaced, status = "MysqlClusterStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Master","type":"string","jsonPath":".status.currentMaster"}"#)]
#[kube(printcolumn = r#"{"name":"MasterReady","type":"string","jsonPath":".status.masterDisplay"}"#)]
#[kube(printcolumn = r#"{"name":"SlaveReady","type":"string","jsonPath":".status.slaveDisplay"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterSpec {
    pub image: String,
    // Signed to stay compatible with the workload API; minimum 2, default 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    pub storage: StorageSpec,
    pub resources: corev1::ResourceRequirements,
    pub secret_name: SecretReference,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum MysqlClusterPhase {
    Pending,
    Initializing,
    Running,
    Degraded,
    Failed,
    Terminating,
}

/// One member as seen by the last reconcile: role label plus the two
/// readiness levels (Kubernetes-ready and MySQL-connectable).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub name: String,
    pub role: String,
    pub is_ready: bool,
    pub is_connectable: bool,
}

// Struct-level default keeps a partially written status (the first-touch
// phase patch) deserializable.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct MysqlClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<MysqlClusterPhase>,

    pub master_replicas: i32,
    pub slave_replicas: i32,
    pub master_display: String,
    pub slave_display: String,
    pub current_master: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<MemberStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<metav1::Condition>>,
}

impl MysqlCluster {
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
    }
}
