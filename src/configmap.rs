use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::common::*;
use crate::mysqlcluster_types::*;

pub fn configmap_build(cluster: &MysqlCluster) -> corev1::ConfigMap {
    corev1::ConfigMap {
        metadata: metav1::ObjectMeta {
            name: Some(config_map_name(cluster)),
            namespace: cluster.meta().namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(BTreeMap::from([(
                APP_LABEL.to_string(),
                cluster.meta().name.as_ref().unwrap().clone(),
            )])),
            ..metav1::ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            ("my.cnf".to_string(), mysqld_config()),
            ("init.sh".to_string(), server_id_init_script()),
        ])),
        ..corev1::ConfigMap::default()
    }
}

// GTID replication requires row binlog and consistency enforcement;
// relay logs are retained so a replica can be re-pointed without purging.
fn mysqld_config() -> String {
    concat!(
        "[mysqld]\n",
        "binlog_format=row\n",
        "log-bin=mysql-bin\n",
        "gtid-mode=on\n",
        "enforce-gtid-consistency=true\n",
        "log-slave-updates=1\n",
        "relay_log_purge=0\n",
    )
    .to_string()
}

// Derives a deterministic server-id from the pod ordinal before mysqld
// starts. Ordinals collide across clusters but not within one, which is
// the only scope server-id has to be unique in.
fn server_id_init_script() -> String {
    concat!(
        "#!/bin/bash\n",
        "set -e\n",
        "ORDINAL=${HOSTNAME##*-}\n",
        "if [[ ! $ORDINAL =~ ^[0-9]+$ ]]; then\n",
        "  echo \"failed to extract ordinal from hostname $HOSTNAME\"\n",
        "  exit 1\n",
        "fi\n",
        "SERVER_ID=$((100 + $ORDINAL))\n",
        "echo \"[mysqld]\" > /etc/mysql/conf.d/server-id.cnf\n",
        "echo \"server-id=$SERVER_ID\" >> /etc/mysql/conf.d/server-id.cnf\n",
    )
    .to_string()
}

/// Hex SHA-256 over the config entries, injected into the pod template as
/// the `checksum/config` annotation so config edits roll the StatefulSet.
/// BTreeMap iteration order makes the digest deterministic.
pub fn config_data_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "demo",
            serde_json::from_value(json!({
                "image": "mysql:8.0",
                "storage": {"size": "1Gi"},
                "resources": {},
                "secretName": {"name": "demo-secret"},
            }))
            .unwrap(),
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster
    }

    #[test]
    fn configmap_carries_both_entries() {
        let cm = configmap_build(&cluster());
        let data = cm.data.unwrap();
        assert!(data.get("my.cnf").unwrap().contains("gtid-mode=on"));
        assert!(data.get("my.cnf").unwrap().contains("log-slave-updates=1"));
        assert!(data
            .get("init.sh")
            .unwrap()
            .contains("SERVER_ID=$((100 + $ORDINAL))"));
    }

    #[test]
    fn equal_data_hashes_equal() {
        let a = configmap_build(&cluster()).data.unwrap();
        let b = configmap_build(&cluster()).data.unwrap();
        assert_eq!(config_data_hash(&a), config_data_hash(&b));
    }

    #[test]
    fn changed_data_changes_hash() {
        let a = configmap_build(&cluster()).data.unwrap();
        let mut b = a.clone();
        b.insert("my.cnf".to_string(), "[mysqld]\n".to_string());
        assert_ne!(config_data_hash(&a), config_data_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let data = BTreeMap::from([("k".to_string(), "v".to_string())]);
        let hash = config_data_hash(&data);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
