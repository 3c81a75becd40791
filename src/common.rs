use crate::mysqlcluster_types::*;

pub const APP_LABEL: &str = "app";
pub const ROLE_LABEL: &str = "role";
pub const ROLE_MASTER: &str = "master";
pub const ROLE_SLAVE: &str = "slave";

pub const CONFIG_HASH_ANNOTATION: &str = "checksum/config";

pub const ROOT_PASSWORD_KEY: &str = "root-password";
pub const REPL_PASSWORD_KEY: &str = "repl-password";

// Replication account used by CHANGE MASTER TO on every replica.
pub const REPL_USER: &str = "repl";

pub const MYSQL_PORT: i32 = 3306;

pub fn service_name(cluster: &MysqlCluster, role: &str) -> String {
    format!("{}-svc-{}", cluster.metadata.name.as_ref().unwrap(), role)
}

pub fn headless_service_name(cluster: &MysqlCluster) -> String {
    service_name(cluster, "headless")
}

pub fn config_map_name(cluster: &MysqlCluster) -> String {
    cluster.metadata.name.as_ref().unwrap().clone() + "-configmap"
}

pub fn stateful_set_name(cluster: &MysqlCluster) -> String {
    cluster.metadata.name.as_ref().unwrap().clone() + "-statefulset"
}

/// Stable per-pod DNS name through the headless service; replicas address
/// the primary by this name in CHANGE MASTER TO.
pub fn pod_headless_fqdn(cluster: &MysqlCluster, pod_name: &str) -> String {
    format!(
        "{}.{}.{}",
        pod_name,
        headless_service_name(cluster),
        cluster.metadata.namespace.as_ref().unwrap()
    )
}
