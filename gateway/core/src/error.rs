use crate::{ApiError, BoxError, IngressKey, ResourceId};
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Describes why a gateway operation failed.
///
/// Every failure is returned to the caller; none are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The namespace is outside the observed set. Raised before any cluster
    /// call is made.
    #[error("namespace {namespace} is not observed")]
    NotObservedNamespace { namespace: String },

    #[error("{kind} {name} not found in {}", .namespace.as_deref().unwrap_or("any observed namespace"))]
    NotFound {
        kind: String,
        namespace: Option<String>,
        name: String,
    },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: String, id: ResourceId },

    /// Concurrent writers kept invalidating the resource version we read.
    #[error("{kind} {id} was modified concurrently; gave up after {attempts} attempts")]
    Conflict {
        kind: String,
        id: ResourceId,
        attempts: usize,
    },

    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    #[error("failed to reach the cluster for {kind} in {namespace}")]
    Transport {
        kind: String,
        namespace: String,
        #[source]
        source: BoxError,
    },

    /// The client factory could not build a client for an identity.
    #[error("failed to build a cluster client")]
    Client(#[source] BoxError),
}

/// Reports a bulk ingress-path removal in which some paths could not be
/// removed. Removed paths stay removed.
#[derive(Debug, Default)]
pub struct PartialFailure {
    pub removed: Vec<(IngressKey, String)>,
    pub failed: Vec<FailedPath>,
}

#[derive(Debug)]
pub struct FailedPath {
    pub ingress: IngressKey,
    pub path: String,
    pub error: Error,
}

// === impl Error ===

impl Error {
    /// Attaches resource coordinates to the failure of a cluster call.
    pub(crate) fn from_api(error: ApiError, kind: &str, namespace: &str, name: Option<&str>) -> Self {
        let name = name.unwrap_or_default();
        match error {
            ApiError::NotFound => Self::NotFound {
                kind: kind.to_string(),
                namespace: Some(namespace.to_string()),
                name: name.to_string(),
            },
            ApiError::AlreadyExists => Self::AlreadyExists {
                kind: kind.to_string(),
                id: ResourceId::new(namespace, name),
            },
            ApiError::Conflict => Self::Conflict {
                kind: kind.to_string(),
                id: ResourceId::new(namespace, name),
                attempts: 1,
            },
            ApiError::Transport(source) => Self::Transport {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                source,
            },
        }
    }

    pub fn not_found(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// === impl PartialFailure ===

impl PartialFailure {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    /// The `(ingress, path)` pairs that could not be removed.
    pub fn failed_paths(&self) -> impl Iterator<Item = (&IngressKey, &str)> + '_ {
        self.failed.iter().map(|f| (&f.ingress, f.path.as_str()))
    }
}

impl std::error::Error for PartialFailure {}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to remove {} of {} ingress paths:",
            self.failed.len(),
            self.failed.len() + self.removed.len()
        )?;
        for FailedPath {
            ingress,
            path,
            error,
        } in &self.failed
        {
            write!(f, " {path} on {ingress} ({error});")?;
        }
        Ok(())
    }
}
