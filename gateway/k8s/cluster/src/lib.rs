//! Reaches the cluster through `kube`.
//!
//! [`KubeCluster`] implements the gateway's [`ResourceApi`] for every
//! namespaced kind on top of a `kube::Client`, and [`MakeKubeClient`] builds
//! one per identity for the client cache.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    config::AuthInfo,
    Client, Config,
};
use plugin_gateway_core::{ApiError, BoxError, MakeClient, ResourceApi};
use plugin_gateway_k8s_api::{NamespaceResourceScope, Resource};
use secrecy::SecretString;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use tokio::time::Duration;

/// A cluster reached with one identity's credentials.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

/// Builds a [`KubeCluster`] per identity token.
///
/// Each client uses the process's cluster endpoint and TLS settings with the
/// process credentials replaced by the identity's bearer token.
#[derive(Clone)]
pub struct MakeKubeClient {
    base: Config,
    read_timeout: Duration,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K> ResourceApi<K> for KubeCluster
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    K: Clone + fmt::Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn list(&self, namespace: &str) -> Result<Vec<K>, ApiError> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        tracing::trace!(%namespace, kind = %K::kind(&()), items = list.items.len(), "Listed");
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(classify)
    }

    async fn create(&self, namespace: &str, resource: &K) -> Result<K, ApiError> {
        self.api::<K>(namespace)
            .create(&PostParams::default(), resource)
            .await
            .map_err(classify)
    }

    async fn replace(&self, namespace: &str, name: &str, resource: &K) -> Result<K, ApiError> {
        self.api::<K>(namespace)
            .replace(name, &PostParams::default(), resource)
            .await
            .map_err(classify)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ApiError> {
        // Background propagation: the request returns once the cluster has
        // accepted it, and dependents are reaped afterwards.
        let params = DeleteParams {
            preconditions: resource_version.map(|v| Preconditions {
                resource_version: Some(v.to_string()),
                uid: None,
            }),
            ..DeleteParams::background()
        };
        self.api::<K>(namespace)
            .delete(name, &params)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Maps a `kube` failure onto the gateway's classification. Anything that is
/// not a well-known API status is a transport failure.
fn classify(error: kube::Error) -> ApiError {
    match &error {
        kube::Error::Api(status) if status.code == 404 => ApiError::NotFound,
        kube::Error::Api(status) if status.code == 409 && status.reason == "AlreadyExists" => {
            ApiError::AlreadyExists
        }
        kube::Error::Api(status) if status.code == 409 => ApiError::Conflict,
        _ => ApiError::Transport(Box::new(error)),
    }
}

// === impl MakeKubeClient ===

impl MakeKubeClient {
    pub fn new(base: Config, read_timeout: Duration) -> Self {
        Self { base, read_timeout }
    }

    /// Infers the base configuration from the environment: in-cluster
    /// service account settings or the local kubeconfig.
    pub async fn infer(read_timeout: Duration) -> Result<Self, kube::config::InferConfigError> {
        let base = Config::infer().await?;
        Ok(Self::new(base, read_timeout))
    }

    /// The namespace the base configuration operates in.
    pub fn default_namespace(&self) -> &str {
        &self.base.default_namespace
    }
}

impl MakeClient<KubeCluster> for MakeKubeClient {
    /// Must be called within a Tokio runtime, which the client's request
    /// buffer is spawned on.
    fn make_client(&self, token: &str) -> Result<KubeCluster, BoxError> {
        let mut config = self.base.clone();
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..Default::default()
        };
        config.read_timeout = Some(self.read_timeout);
        let client = Client::try_from(config)?;
        tracing::debug!(cluster_url = %self.base.cluster_url, "Built identity client");
        Ok(KubeCluster::new(client))
    }
}

impl fmt::Debug for MakeKubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MakeKubeClient")
            .field("cluster_url", &self.base.cluster_url)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason}: test"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_statuses() {
        assert!(matches!(classify(api_error(404, "NotFound")), ApiError::NotFound));
        assert!(matches!(
            classify(api_error(409, "AlreadyExists")),
            ApiError::AlreadyExists
        ));
        assert!(matches!(classify(api_error(409, "Conflict")), ApiError::Conflict));
        assert!(matches!(
            classify(api_error(403, "Forbidden")),
            ApiError::Transport(_)
        ));
    }

    #[test]
    fn debug_output_omits_credentials() {
        let mut base = Config::new("https://cluster.example.com:6443".parse().unwrap());
        base.auth_info = AuthInfo {
            username: Some("admin".to_string()),
            ..Default::default()
        };
        let make = MakeKubeClient::new(base, Duration::from_secs(30));
        assert_eq!(make.default_namespace(), "default");

        let debug = format!("{make:?}");
        assert!(debug.contains("cluster.example.com"));
        assert!(!debug.contains("admin"));
    }
}
