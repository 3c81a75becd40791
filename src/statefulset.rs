use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;
use std::collections::BTreeMap;
use tracing::*;

use crate::common::*;
use crate::mysqlcluster_types::*;

pub fn statefulset_build(cluster: &MysqlCluster, config_hash: &str) -> appsv1::StatefulSet {
    let labels = BTreeMap::from([(
        APP_LABEL.to_string(),
        cluster.meta().name.as_ref().unwrap().clone(),
    )]);

    appsv1::StatefulSet {
        metadata: metav1::ObjectMeta {
            name: Some(stateful_set_name(cluster)),
            namespace: cluster.meta().namespace.clone(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(appsv1::StatefulSetSpec {
            replicas: Some(cluster.desired_replicas()),
            // Must match the headless service so members get stable DNS.
            service_name: headless_service_name(cluster),
            selector: metav1::LabelSelector {
                match_labels: Some(labels.clone()),
                ..metav1::LabelSelector::default()
            },
            update_strategy: Some(appsv1::StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..appsv1::StatefulSetUpdateStrategy::default()
            }),
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        config_hash.to_string(),
                    )])),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(mysql_pod_spec(cluster)),
            },
            volume_claim_templates: Some(vec![corev1::PersistentVolumeClaim {
                metadata: metav1::ObjectMeta {
                    name: Some("data".to_string()),
                    ..metav1::ObjectMeta::default()
                },
                spec: Some(corev1::PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(corev1::ResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            cluster.spec.storage.size.clone(),
                        )])),
                        ..corev1::ResourceRequirements::default()
                    }),
                    storage_class_name: cluster.spec.storage.storage_class_name.clone(),
                    ..corev1::PersistentVolumeClaimSpec::default()
                }),
                ..corev1::PersistentVolumeClaim::default()
            }]),
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    }
}

fn mysql_pod_spec(cluster: &MysqlCluster) -> corev1::PodSpec {
    let ping_probe = corev1::ExecAction {
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "mysqladmin ping -u root -p${MYSQL_ROOT_PASSWORD}".to_string(),
        ]),
    };

    corev1::PodSpec {
        containers: vec![corev1::Container {
            name: "mysql".to_string(),
            image: Some(cluster.spec.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            resources: Some(cluster.spec.resources.clone()),
            ports: Some(vec![corev1::ContainerPort {
                name: Some("mysql".to_string()),
                container_port: MYSQL_PORT,
                ..corev1::ContainerPort::default()
            }]),
            env: Some(vec![
                corev1::EnvVar {
                    name: "MYSQL_ROOT_PASSWORD".to_string(),
                    value_from: Some(corev1::EnvVarSource {
                        secret_key_ref: Some(corev1::SecretKeySelector {
                            name: Some(cluster.spec.secret_name.name.clone()),
                            key: ROOT_PASSWORD_KEY.to_string(),
                            ..corev1::SecretKeySelector::default()
                        }),
                        ..corev1::EnvVarSource::default()
                    }),
                    ..corev1::EnvVar::default()
                },
                corev1::EnvVar {
                    name: "MYSQL_ROOT_HOST".to_string(),
                    value: Some("%".to_string()),
                    ..corev1::EnvVar::default()
                },
            ]),
            // Copy the managed my.cnf into the drop-in directory, derive the
            // server-id, then hand off to the stock entrypoint.
            command: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "cp /mnt/config/my.cnf /etc/mysql/conf.d/99-custom.cnf && /mnt/config/init.sh && exec /usr/local/bin/docker-entrypoint.sh mysqld".to_string(),
            ]),
            volume_mounts: Some(vec![
                corev1::VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/var/lib/mysql".to_string(),
                    ..corev1::VolumeMount::default()
                },
                corev1::VolumeMount {
                    name: "config".to_string(),
                    mount_path: "/mnt/config".to_string(),
                    ..corev1::VolumeMount::default()
                },
            ]),
            liveness_probe: Some(corev1::Probe {
                exec: Some(ping_probe.clone()),
                initial_delay_seconds: Some(30),
                period_seconds: Some(10),
                timeout_seconds: Some(5),
                ..corev1::Probe::default()
            }),
            // Aggressive readiness so a dead member drops out of the role
            // services within a few seconds and failover can start.
            readiness_probe: Some(corev1::Probe {
                exec: Some(ping_probe),
                period_seconds: Some(2),
                timeout_seconds: Some(1),
                failure_threshold: Some(2),
                success_threshold: Some(1),
                ..corev1::Probe::default()
            }),
            ..corev1::Container::default()
        }],
        volumes: Some(vec![corev1::Volume {
            name: "config".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(config_map_name(cluster)),
                // Executable so init.sh can run as the container command.
                default_mode: Some(0o755),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        }]),
        ..corev1::PodSpec::default()
    }
}

/// Update policy for an existing StatefulSet: only the config digest
/// annotation and upward replica moves are reconciled. Scale-down is a
/// non-goal and gets logged and ignored; any other drift is accepted so
/// the controller does not fight manual operator intervention.
/// Returns the object to write, or None when nothing changed.
pub fn apply_update_policy(
    existing: &appsv1::StatefulSet,
    desired_replicas: i32,
    config_hash: &str,
) -> Option<appsv1::StatefulSet> {
    let mut updated = existing.clone();
    let mut changed = false;

    if let Some(spec) = updated.spec.as_mut() {
        let template_meta = spec
            .template
            .metadata
            .get_or_insert_with(metav1::ObjectMeta::default);
        let annotations = template_meta
            .annotations
            .get_or_insert_with(BTreeMap::default);
        if annotations.get(CONFIG_HASH_ANNOTATION).map(String::as_str) != Some(config_hash) {
            info!(
                "Config digest changed on {}: {:?} -> {}",
                existing.metadata.name.as_deref().unwrap_or_default(),
                annotations.get(CONFIG_HASH_ANNOTATION),
                config_hash
            );
            annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string());
            changed = true;
        }

        let current_replicas = spec.replicas.unwrap_or(0);
        if desired_replicas > current_replicas {
            info!(
                "Scaling up {}: {} -> {}",
                existing.metadata.name.as_deref().unwrap_or_default(),
                current_replicas,
                desired_replicas
            );
            spec.replicas = Some(desired_replicas);
            changed = true;
        } else if desired_replicas < current_replicas {
            warn!(
                "Scale-down requested ({} -> {}) but automatic scale-down is disabled; ignoring",
                current_replicas, desired_replicas
            );
        }
    }

    changed.then(|| updated)
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
                "replicas": 3,
                "storage": {"size": "10Gi", "storageClassName": "fast"},
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
    fn template_carries_config_digest_annotation() {
        let sts = statefulset_build(&cluster(), "abc123");
        let annotations = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(annotations.get("checksum/config").unwrap(), "abc123");
    }

    #[test]
    fn config_volume_is_executable() {
        let sts = statefulset_build(&cluster(), "h");
        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let config = volumes.iter().find(|v| v.name == "config").unwrap();
        assert_eq!(config.config_map.as_ref().unwrap().default_mode, Some(0o755));
    }

    #[test]
    fn pvc_template_uses_requested_size_and_class() {
        let sts = statefulset_build(&cluster(), "h");
        let pvc = &sts.spec.unwrap().volume_claim_templates.unwrap()[0];
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        let requests = spec.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "10Gi");
    }

    #[test]
    fn readiness_probe_is_aggressive() {
        let sts = statefulset_build(&cluster(), "h");
        let container = &sts.spec.unwrap().template.spec.unwrap().containers[0];
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.period_seconds, Some(2));
        assert_eq!(readiness.timeout_seconds, Some(1));
        assert_eq!(readiness.failure_threshold, Some(2));
    }

    #[test]
    fn digest_change_updates_annotation_once() {
        let existing = statefulset_build(&cluster(), "old");
        let updated = apply_update_policy(&existing, 3, "new").unwrap();
        let annotations = updated
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(annotations.get("checksum/config").unwrap(), "new");
        // Same digest again: no further update.
        let existing = statefulset_build(&cluster(), "new");
        assert!(apply_update_policy(&existing, 3, "new").is_none());
    }

    #[test]
    fn replica_reconciliation_is_one_way() {
        let existing = statefulset_build(&cluster(), "h");
        // Upward move is applied.
        let updated = apply_update_policy(&existing, 5, "h").unwrap();
        assert_eq!(updated.spec.unwrap().replicas, Some(5));
        // Downward move is ignored entirely.
        assert!(apply_update_policy(&existing, 2, "h").is_none());
    }
}
