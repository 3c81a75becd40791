use k8s_openapi::api::core::v1 as corev1;
use kube::api::Api;
use kube::Client;

use crate::common::{REPL_PASSWORD_KEY, ROOT_PASSWORD_KEY};
use crate::mysqlcluster_types::*;
use crate::Error;

/// Reads the user-provided Secret and returns the two cleartext passwords
/// (root, repl). Both keys are mandatory; a missing object or key is a
/// configuration error the user has to fix, not something to retry hard.
pub async fn read_credentials(
    client: &Client,
    cluster: &MysqlCluster,
) -> Result<(String, String), Error> {
    let namespace = cluster.metadata.namespace.as_ref().unwrap();
    let secret_name = &cluster.spec.secret_name.name;

    let secret_api = Api::<corev1::Secret>::namespaced(client.clone(), namespace);
    let secret = secret_api
        .get_opt(secret_name)
        .await
        .map_err(Error::SecretGetFailed)?
        .ok_or_else(|| Error::SecretMissing(secret_name.clone()))?;

    let data = secret.data.unwrap_or_default();
    let root_password = data
        .get(ROOT_PASSWORD_KEY)
        .ok_or_else(|| Error::SecretKeyMissing(secret_name.clone(), ROOT_PASSWORD_KEY))?;
    let repl_password = data
        .get(REPL_PASSWORD_KEY)
        .ok_or_else(|| Error::SecretKeyMissing(secret_name.clone(), REPL_PASSWORD_KEY))?;

    Ok((
        String::from_utf8_lossy(&root_password.0).into_owned(),
        String::from_utf8_lossy(&repl_password.0).into_owned(),
    ))
}
