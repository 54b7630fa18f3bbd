//! Shares one ingress between independently linked plugins.
//!
//! Each linked plugin contributes one `(path, target)` pair to the ingress of
//! a host. The coalescer keeps the ingress's path set equal to the union of
//! the contributions: adding inserts a path if absent, removing deletes
//! exactly that path, and removing the last path deletes the ingress.
//!
//! ```text
//! Absent --add--> Present{paths} --add/remove--> Present{paths'}
//!                 Present{paths} --remove last--> Absent
//! ```
//!
//! There is no local locking. Concurrent writers are serialized by the
//! cluster's resource-version check: a write based on a stale read is
//! rejected, and the coalescer re-reads and retries a bounded number of
//! times before surfacing [`Error::Conflict`].

use crate::{
    error::{FailedPath, PartialFailure},
    ApiError, Error, ObservedNamespaces, ResourceApi, ResourceId, Result,
};
use plugin_gateway_k8s_api::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ObjectMeta, Resource, ResourceExt, ServiceBackendPort,
    MANAGED_BY, MANAGED_BY_LABEL,
};
use std::{fmt, sync::Arc};
use tracing::{debug, instrument};

pub const PATH_TYPE: &str = "Prefix";

/// Identifies the ingress that serves `host` in `namespace`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngressKey {
    pub namespace: String,
    pub name: String,
    pub host: String,
}

/// The backend service that a path routes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IngressTarget {
    pub service: String,
    pub port: i32,
}

pub struct IngressCoalescer<A> {
    api: A,
    namespaces: Arc<ObservedNamespaces>,
    max_attempts: usize,
}

enum Step {
    Done(Option<Ingress>),
    Retry,
}

// === impl IngressKey ===

impl IngressKey {
    pub fn new(namespace: impl ToString, name: impl ToString, host: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            host: host.to_string(),
        }
    }

    fn id(&self) -> ResourceId {
        ResourceId::new(&self.namespace, &self.name)
    }
}

impl fmt::Display for IngressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.host)
    }
}

// === impl IngressTarget ===

impl IngressTarget {
    pub fn new(service: impl ToString, port: i32) -> Self {
        Self {
            service: service.to_string(),
            port,
        }
    }

    fn to_backend(&self) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: self.service.clone(),
                port: Some(ServiceBackendPort {
                    number: Some(self.port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn from_backend(backend: &IngressBackend) -> Option<Self> {
        let service = backend.service.as_ref()?;
        let port = service.port.as_ref()?.number?;
        Some(Self::new(&service.name, port))
    }
}

// === impl IngressCoalescer ===

impl<A: ResourceApi<Ingress>> IngressCoalescer<A> {
    pub fn new(api: A, namespaces: Arc<ObservedNamespaces>) -> Self {
        Self {
            api,
            namespaces,
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[instrument(skip(self), fields(ingress = %key))]
    pub async fn get(&self, key: &IngressKey) -> Result<Option<Ingress>> {
        self.namespaces.require_observed(&key.namespace)?;
        self.read(key).await
    }

    /// Adds `path` to the key's ingress, creating the ingress if it is absent.
    ///
    /// Adding a path that is already routed to `target` changes nothing. A
    /// path routed elsewhere is pointed at `target`.
    #[instrument(skip(self, target), fields(ingress = %key, service = %target.service))]
    pub async fn add_path(
        &self,
        key: &IngressKey,
        path: &str,
        target: &IngressTarget,
    ) -> Result<Ingress> {
        self.namespaces.require_observed(&key.namespace)?;

        for attempt in 1..=self.max_attempts {
            let written = match self.read(key).await? {
                None => {
                    let ingress = new_ingress(key, path, target);
                    self.api.create(&key.namespace, &ingress).await
                }
                Some(mut ingress) => {
                    if !insert_path(&mut ingress, &key.host, path, target) {
                        debug!("Path already present");
                        return Ok(ingress);
                    }
                    self.api.replace(&key.namespace, &key.name, &ingress).await
                }
            };

            match written {
                Ok(ingress) => {
                    debug!(attempt, "Added path");
                    return Ok(ingress);
                }
                // Another writer created, modified or deleted the ingress
                // since it was read.
                Err(ApiError::AlreadyExists | ApiError::Conflict | ApiError::NotFound) => {
                    debug!(attempt, "Ingress changed concurrently; retrying");
                }
                Err(error) => return Err(self.api_error(key, error)),
            }
        }

        Err(self.conflict(key))
    }

    /// Removes `path` from the key's ingress, deleting the ingress once no
    /// paths remain.
    ///
    /// Removing from an absent ingress, or removing a path that is not
    /// present, succeeds without writing. Returns the remaining ingress, if
    /// any.
    #[instrument(skip(self), fields(ingress = %key))]
    pub async fn remove_path(&self, key: &IngressKey, path: &str) -> Result<Option<Ingress>> {
        self.namespaces.require_observed(&key.namespace)?;

        for attempt in 1..=self.max_attempts {
            match self.try_remove_path(key, path).await? {
                Step::Done(ingress) => {
                    debug!(attempt, deleted = ingress.is_none(), "Removed path");
                    return Ok(ingress);
                }
                Step::Retry => debug!(attempt, "Ingress changed concurrently; retrying"),
            }
        }

        Err(self.conflict(key))
    }

    /// Removes each `(ingress, path)` pair as an independent step.
    ///
    /// Steps that succeed are not reverted when others fail; the failures are
    /// reported together as [`Error::PartialFailure`].
    pub async fn remove_paths(
        &self,
        paths: impl IntoIterator<Item = (IngressKey, String)>,
    ) -> Result<()> {
        let mut report = PartialFailure::default();
        for (ingress, path) in paths {
            match self.remove_path(&ingress, &path).await {
                Ok(_) => report.removed.push((ingress, path)),
                Err(error) => report.failed.push(FailedPath {
                    ingress,
                    path,
                    error,
                }),
            }
        }

        if report.is_empty() {
            return Ok(());
        }
        Err(report.into())
    }

    async fn try_remove_path(&self, key: &IngressKey, path: &str) -> Result<Step> {
        let Some(mut ingress) = self.read(key).await? else {
            return Ok(Step::Done(None));
        };
        if !remove_path(&mut ingress, &key.host, path) {
            return Ok(Step::Done(Some(ingress)));
        }

        let written = if has_paths(&ingress) {
            self.api
                .replace(&key.namespace, &key.name, &ingress)
                .await
                .map(Some)
        } else {
            // The delete is conditioned on the version we read so that a path
            // added in the meantime is not deleted with the ingress.
            let version = ingress.resource_version();
            self.api
                .delete(&key.namespace, &key.name, version.as_deref())
                .await
                .map(|()| None)
        };

        match written {
            Ok(ingress) => Ok(Step::Done(ingress)),
            Err(ApiError::Conflict | ApiError::NotFound) => Ok(Step::Retry),
            Err(error) => Err(self.api_error(key, error)),
        }
    }

    async fn read(&self, key: &IngressKey) -> Result<Option<Ingress>> {
        self.api
            .get(&key.namespace, &key.name)
            .await
            .map_err(|e| self.api_error(key, e))
    }

    fn api_error(&self, key: &IngressKey, error: ApiError) -> Error {
        Error::from_api(error, &Ingress::kind(&()), &key.namespace, Some(&key.name))
    }

    fn conflict(&self, key: &IngressKey) -> Error {
        Error::Conflict {
            kind: Ingress::kind(&()).to_string(),
            id: key.id(),
            attempts: self.max_attempts,
        }
    }
}

// === Path sets ===

/// Lists the paths that `host`'s rule routes, in rule order.
pub fn paths(ingress: &Ingress, host: &str) -> Vec<(String, Option<IngressTarget>)> {
    host_rule(ingress, host)
        .and_then(|rule| rule.http.as_ref())
        .map(|http| {
            http.paths
                .iter()
                .map(|p| {
                    (
                        p.path.clone().unwrap_or_default(),
                        IngressTarget::from_backend(&p.backend),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn new_ingress(key: &IngressKey, path: &str, target: &IngressTarget) -> Ingress {
    let mut ingress = Ingress {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(
                [(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(IngressSpec::default()),
        ..Default::default()
    };
    insert_path(&mut ingress, &key.host, path, target);
    ingress
}

/// Routes `path` to `target` on `host`'s rule. Returns false if the ingress
/// already did so.
fn insert_path(ingress: &mut Ingress, host: &str, path: &str, target: &IngressTarget) -> bool {
    let backend = target.to_backend();
    let rules = ingress
        .spec
        .get_or_insert_with(Default::default)
        .rules
        .get_or_insert_with(Vec::new);

    let rule = match rules.iter().position(|r| r.host.as_deref() == Some(host)) {
        Some(idx) => &mut rules[idx],
        None => {
            rules.push(IngressRule {
                host: Some(host.to_string()),
                http: None,
            });
            let last = rules.len() - 1;
            &mut rules[last]
        }
    };
    let paths = &mut rule
        .http
        .get_or_insert_with(|| HTTPIngressRuleValue { paths: vec![] })
        .paths;

    if let Some(existing) = paths.iter_mut().find(|p| p.path.as_deref() == Some(path)) {
        if existing.backend == backend {
            return false;
        }
        existing.backend = backend;
        return true;
    }

    paths.push(HTTPIngressPath {
        path: Some(path.to_string()),
        path_type: PATH_TYPE.to_string(),
        backend,
    });
    true
}

/// Removes `path` from `host`'s rule, dropping the rule once it routes
/// nothing. Returns false if the path was not routed.
fn remove_path(ingress: &mut Ingress, host: &str, path: &str) -> bool {
    let Some(rules) = ingress.spec.as_mut().and_then(|s| s.rules.as_mut()) else {
        return false;
    };
    let Some(idx) = rules.iter().position(|r| r.host.as_deref() == Some(host)) else {
        return false;
    };
    let Some(http) = rules[idx].http.as_mut() else {
        return false;
    };

    let before = http.paths.len();
    http.paths.retain(|p| p.path.as_deref() != Some(path));
    if http.paths.len() == before {
        return false;
    }

    // Rules for other hosts are left alone, even ones without paths.
    if http.paths.is_empty() {
        rules.remove(idx);
    }
    true
}

fn has_paths(ingress: &Ingress) -> bool {
    ingress
        .spec
        .iter()
        .flat_map(|s| s.rules.iter().flatten())
        .any(|r| r.http.as_ref().map_or(false, |h| !h.paths.is_empty()))
}

fn host_rule<'i>(ingress: &'i Ingress, host: &str) -> Option<&'i IngressRule> {
    ingress
        .spec
        .as_ref()?
        .rules
        .as_ref()?
        .iter()
        .find(|r| r.host.as_deref() == Some(host))
}
