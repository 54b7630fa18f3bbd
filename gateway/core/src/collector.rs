use crate::{ApiError, Error, ObservedNamespaces, ResourceApi, ResourceId, Result};
use futures::future;
use plugin_gateway_k8s_api::{Resource, ResourceExt};
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, instrument};

/// Reads and writes one resource kind within a set of observed namespaces.
///
/// Every namespace-scoped operation authorizes its namespace before touching
/// the cluster, and operations spanning all namespaces only ever visit the
/// observed set.
pub struct ResourceCollector<K, A> {
    api: A,
    namespaces: Arc<ObservedNamespaces>,
    max_attempts: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K, A> ResourceCollector<K, A>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
    A: ResourceApi<K>,
{
    pub fn new(api: A, namespaces: Arc<ObservedNamespaces>) -> Self {
        Self {
            api,
            namespaces,
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            _kind: PhantomData,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn namespaces(&self) -> &ObservedNamespaces {
        &self.namespaces
    }

    /// Lists the kind in every observed namespace, in observed order.
    ///
    /// A failure in any namespace fails the whole call: an empty namespace
    /// must never be confused with one that could not be read.
    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    pub async fn list_all(&self) -> Result<Vec<K>> {
        let lists =
            future::try_join_all(self.namespaces.iter().map(|ns| self.list_unchecked(ns))).await?;
        Ok(lists.into_iter().flatten().collect())
    }

    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    pub async fn list_in_namespace(&self, namespace: &str) -> Result<Vec<K>> {
        self.namespaces.require_observed(namespace)?;
        self.list_unchecked(namespace).await
    }

    /// Finds a resource by name in any observed namespace.
    ///
    /// Names are not required to be unique across namespaces. When several
    /// namespaces hold the name, the match from the earliest observed
    /// namespace is returned.
    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    pub async fn find_by_name(&self, name: &str) -> Result<Option<K>> {
        let resources = self.list_all().await?;
        Ok(resources.into_iter().find(|r| r.meta().name.as_deref() == Some(name)))
    }

    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    pub async fn find_by_name_and_namespace(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        self.namespaces.require_observed(namespace)?;
        self.api
            .get(namespace, name)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), namespace, Some(name)))
    }

    /// Creates `resource` in its own namespace, or in the default namespace
    /// if it names none.
    ///
    /// Fails with [`Error::AlreadyExists`] if the name is taken in that
    /// namespace.
    #[instrument(skip_all, fields(kind = %K::kind(&()), name = %resource.name_any()))]
    pub async fn create(&self, mut resource: K) -> Result<K> {
        let namespace = self.target_namespace(&mut resource)?;
        let name = resource.name_any();
        let created = self
            .api
            .create(&namespace, &resource)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), &namespace, Some(name.as_str())))?;
        debug!(%namespace, "Created");
        Ok(created)
    }

    /// Creates `resource`, replacing any existing resource of the same name in
    /// the target namespace.
    #[instrument(skip_all, fields(kind = %K::kind(&()), name = %resource.name_any()))]
    pub async fn create_or_replace(&self, mut resource: K) -> Result<K> {
        let namespace = self.target_namespace(&mut resource)?;
        let name = resource.name_any();
        let kind = K::kind(&());
        let api_error = |e: ApiError| Error::from_api(e, &kind, &namespace, Some(name.as_str()));

        for attempt in 1..=self.max_attempts {
            resource.meta_mut().resource_version = None;
            match self.api.create(&namespace, &resource).await {
                Ok(created) => return Ok(created),
                Err(ApiError::AlreadyExists) => {}
                Err(error) => return Err(api_error(error)),
            }

            let Some(current) = self.api.get(&namespace, &name).await.map_err(api_error)? else {
                debug!(attempt, "Deleted before it could be replaced; retrying");
                continue;
            };
            resource.meta_mut().resource_version = current.resource_version();
            match self.api.replace(&namespace, &name, &resource).await {
                Ok(replaced) => return Ok(replaced),
                Err(ApiError::Conflict | ApiError::NotFound) => {
                    debug!(attempt, "Modified concurrently; retrying");
                }
                Err(error) => return Err(api_error(error)),
            }
        }

        Err(Error::Conflict {
            kind: kind.to_string(),
            id: ResourceId::new(&namespace, &name),
            attempts: self.max_attempts,
        })
    }

    /// Requests deletion of the named resource.
    ///
    /// Fails with [`Error::NotFound`] if it does not exist. Returns once the
    /// cluster has accepted the request.
    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        self.namespaces.require_observed(namespace)?;
        self.api
            .delete(namespace, name, None)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), namespace, Some(name)))?;
        debug!("Deleted");
        Ok(())
    }

    async fn list_unchecked(&self, namespace: &str) -> Result<Vec<K>> {
        self.api
            .list(namespace)
            .await
            .map_err(|e| Error::from_api(e, &K::kind(&()), namespace, None))
    }

    fn target_namespace(&self, resource: &mut K) -> Result<String> {
        let namespace = self
            .namespaces
            .resolve_target(resource.meta().namespace.as_deref())?
            .to_string();
        resource.meta_mut().namespace = Some(namespace.clone());
        Ok(namespace)
    }
}
