//! An in-memory stand-in for the cluster's resource store.
//!
//! [`FakeCluster`] is strongly consistent and versioned like the real API
//! server: every write bumps a cluster-wide resource version, replaces are
//! rejected when they present a stale version, and deletes honor a version
//! precondition. It records every call so tests can assert on what reached
//! the cluster, and it yields to the scheduler on every call so concurrent
//! callers interleave.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_gateway_core::{ApiError, ResourceApi};
use plugin_gateway_k8s_api::Resource;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// A versioned, in-memory resource store shared by all of its clones.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Get,
    Create,
    Replace,
    Delete,
}

/// A request that reached the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub namespace: String,
    pub name: Option<String>,
}

type Hook = Box<dyn FnOnce(&FakeCluster) + Send>;

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String, String), serde_json::Value>,
    version: u64,
    calls: Vec<Call>,
    failing: HashSet<String>,
    before_write: HashMap<String, Vec<Hook>>,
}

#[derive(Debug)]
struct Unavailable(String);

// === impl FakeCluster ===

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call in `namespace` fail with a transport error.
    pub fn fail_namespace(&self, namespace: impl ToString) {
        self.state.lock().failing.insert(namespace.to_string());
    }

    pub fn restore_namespace(&self, namespace: &str) {
        self.state.lock().failing.remove(namespace);
    }

    /// Runs `hook` immediately before the next create, replace or delete of
    /// kind `K`, after that request has read whatever it read. Hooks model a
    /// concurrent writer that wins the race.
    pub fn before_next_write<K>(&self, hook: impl FnOnce(&FakeCluster) + Send + 'static)
    where
        K: Resource<DynamicType = ()>,
    {
        self.state
            .lock()
            .before_write
            .entry(K::kind(&()).to_string())
            .or_default()
            .push(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_in(&self, namespace: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.namespace == namespace)
            .collect()
    }

    /// Counts the recorded calls of `verb` on kind `K`.
    pub fn count<K: Resource<DynamicType = ()>>(&self, verb: Verb) -> usize {
        let kind = K::kind(&());
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Stores `resource` unconditionally, bypassing call recording and
    /// failure injection. Returns it as stored.
    pub fn insert<K>(&self, resource: K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let mut state = self.state.lock();
        let namespace = resource.meta().namespace.clone().unwrap_or_default();
        state
            .store(namespace, resource)
            .expect("resource must serialize")
    }

    /// Reads a stored resource without recording a call.
    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = State::key::<K>(namespace, name);
        let state = self.state.lock();
        let value = state.objects.get(&key)?.clone();
        Some(serde_json::from_value(value).expect("stored resource must deserialize"))
    }

    /// Lists stored resources of kind `K` in `namespace` without recording a
    /// call.
    pub fn objects<K>(&self, namespace: &str) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.state
            .lock()
            .values::<K>(namespace)
            .map(|v| serde_json::from_value(v.clone()).expect("stored resource must deserialize"))
            .collect()
    }

    /// Modifies a stored resource in place, bumping its resource version.
    ///
    /// Panics if the resource does not exist.
    pub fn update<K>(&self, namespace: &str, name: &str, modify: impl FnOnce(&mut K))
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let mut resource = self
            .object::<K>(namespace, name)
            .unwrap_or_else(|| panic!("{}/{namespace}/{name} must exist", K::kind(&())));
        modify(&mut resource);
        self.state
            .lock()
            .store(namespace.to_string(), resource)
            .expect("resource must serialize");
    }

    /// Removes a stored resource without recording a call.
    pub fn remove<K>(&self, namespace: &str, name: &str) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        let key = State::key::<K>(namespace, name);
        self.state.lock().objects.remove(&key).is_some()
    }

    /// Records the call and fails it if its namespace is unavailable.
    async fn begin<K: Resource<DynamicType = ()>>(
        &self,
        verb: Verb,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<(), ApiError> {
        tokio::task::yield_now().await;

        let hooks = {
            let mut state = self.state.lock();
            state.calls.push(Call {
                verb,
                kind: K::kind(&()).to_string(),
                namespace: namespace.to_string(),
                name: name.map(ToString::to_string),
            });
            if state.failing.contains(namespace) {
                return Err(ApiError::Transport(Box::new(Unavailable(
                    namespace.to_string(),
                ))));
            }
            match verb {
                Verb::Create | Verb::Replace | Verb::Delete => state
                    .before_write
                    .remove(&*K::kind(&()))
                    .unwrap_or_default(),
                Verb::List | Verb::Get => Vec::new(),
            }
        };

        for hook in hooks {
            tracing::debug!(?verb, %namespace, "Running concurrent writer");
            hook(self);
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ResourceApi<K> for FakeCluster
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self, namespace: &str) -> Result<Vec<K>, ApiError> {
        self.begin::<K>(Verb::List, namespace, None).await?;
        let state = self.state.lock();
        let resources = state
            .values::<K>(namespace)
            .map(|v| decode(v.clone()))
            .collect::<Result<Vec<_>, _>>();
        resources
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        self.begin::<K>(Verb::Get, namespace, Some(name)).await?;
        let key = State::key::<K>(namespace, name);
        let value = self.state.lock().objects.get(&key).cloned();
        value.map(decode).transpose()
    }

    async fn create(&self, namespace: &str, resource: &K) -> Result<K, ApiError> {
        let name = resource.meta().name.clone().unwrap_or_default();
        self.begin::<K>(Verb::Create, namespace, Some(&name)).await?;

        let mut state = self.state.lock();
        if state.objects.contains_key(&State::key::<K>(namespace, &name)) {
            return Err(ApiError::AlreadyExists);
        }
        let resource = decode::<K>(encode(resource)?)?;
        state.store(namespace.to_string(), resource)
    }

    async fn replace(&self, namespace: &str, name: &str, resource: &K) -> Result<K, ApiError> {
        self.begin::<K>(Verb::Replace, namespace, Some(name)).await?;

        let mut state = self.state.lock();
        let stored = state
            .version_of(&State::key::<K>(namespace, name))
            .ok_or(ApiError::NotFound)?;
        // An update without a resource version is unconditional.
        if let Some(version) = resource.meta().resource_version.as_deref() {
            if version != stored {
                return Err(ApiError::Conflict);
            }
        }
        let resource = decode::<K>(encode(resource)?)?;
        state.store(namespace.to_string(), resource)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), ApiError> {
        self.begin::<K>(Verb::Delete, namespace, Some(name)).await?;

        let mut state = self.state.lock();
        let key = State::key::<K>(namespace, name);
        let stored = state.version_of(&key).ok_or(ApiError::NotFound)?;
        if resource_version.is_some_and(|v| v != stored) {
            return Err(ApiError::Conflict);
        }
        state.objects.remove(&key);
        Ok(())
    }
}

// === impl State ===

impl State {
    fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> (String, String, String) {
        (
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    fn values<K: Resource<DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> impl Iterator<Item = &serde_json::Value> + '_ {
        let kind = K::kind(&()).to_string();
        let namespace = namespace.to_string();
        self.objects
            .iter()
            .filter(move |((k, ns, _), _)| *k == kind && *ns == namespace)
            .map(|(_, v)| v)
    }

    fn version_of(&self, key: &(String, String, String)) -> Option<String> {
        let value = self.objects.get(key)?;
        let version = value.pointer("/metadata/resourceVersion")?.as_str()?;
        Some(version.to_string())
    }

    /// Stamps the resource with a fresh version and stores it.
    fn store<K>(&mut self, namespace: String, mut resource: K) -> Result<K, ApiError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.version += 1;
        let name = resource.meta().name.clone().unwrap_or_default();
        let meta = resource.meta_mut();
        meta.namespace = Some(namespace.clone());
        meta.resource_version = Some(self.version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.version));
        }

        let value = encode(&resource)?;
        self.objects
            .insert((K::kind(&()).to_string(), namespace, name), value);
        Ok(resource)
    }
}

// === impl Unavailable ===

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "namespace {} is unavailable", self.0)
    }
}

impl std::error::Error for Unavailable {}

fn encode<K: Serialize>(resource: &K) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(resource).map_err(|e| ApiError::Transport(Box::new(e)))
}

fn decode<K: DeserializeOwned>(value: serde_json::Value) -> Result<K, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Transport(Box::new(e)))
}
