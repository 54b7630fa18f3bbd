use async_trait::async_trait;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classifies the failures of a single cluster call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("resource not found")]
    NotFound,

    #[error("resource already exists")]
    AlreadyExists,

    /// The write presented a stale resource version.
    #[error("resource version conflict")]
    Conflict,

    #[error("cluster request failed: {0}")]
    Transport(#[source] BoxError),
}

/// Models the cluster's API for one namespaced resource kind.
///
/// The cluster is an authoritative, strongly consistent store of manifests.
/// Every stored manifest carries a resource version that changes on each
/// write.
#[async_trait]
pub trait ResourceApi<K>: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Vec<K>, ApiError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError>;

    /// Fails with [`ApiError::AlreadyExists`] if `namespace` already holds a
    /// resource of the same name.
    async fn create(&self, namespace: &str, resource: &K) -> Result<K, ApiError>;

    /// Replaces the stored resource.
    ///
    /// The write is rejected with [`ApiError::Conflict`] unless `resource`
    /// carries the stored resource version.
    async fn replace(&self, namespace: &str, name: &str, resource: &K) -> Result<K, ApiError>;

    /// Requests deletion. Returns once the request is accepted, before
    /// dependent objects are reaped.
    ///
    /// When `resource_version` is set, the delete is rejected with
    /// [`ApiError::Conflict`] if the stored resource has since changed.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ApiError>;
}
