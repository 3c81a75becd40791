use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube_core::Resource;
use std::collections::BTreeMap;

use crate::common::*;
use crate::mysqlcluster_types::*;

/// Builds one of the three cluster services. The `master` and `slave`
/// services select pods by role label; `headless` selects every member and
/// disables the cluster IP so each pod gets a stable DNS name.
pub fn service_build(cluster: &MysqlCluster, role: &str) -> corev1::Service {
    let mut selector = BTreeMap::from([(
        APP_LABEL.to_string(),
        cluster.meta().name.as_ref().unwrap().clone(),
    )]);
    let cluster_ip = if role == "headless" {
        Some("None".to_string())
    } else {
        selector.insert(ROLE_LABEL.to_string(), role.to_string());
        None
    };

    corev1::Service {
        metadata: metav1::ObjectMeta {
            name: Some(service_name(cluster, role)),
            namespace: cluster.meta().namespace.clone(),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            labels: Some(BTreeMap::from([
                (
                    APP_LABEL.to_string(),
                    cluster.meta().name.as_ref().unwrap().clone(),
                ),
                (ROLE_LABEL.to_string(), format!("svc-{}", role)),
            ])),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip,
            selector: Some(selector),
            ports: Some(vec![corev1::ServicePort {
                port: MYSQL_PORT,
                target_port: Some(IntOrString::Int(MYSQL_PORT)),
                protocol: Some("TCP".to_string()),
                ..corev1::ServicePort::default()
            }]),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}
