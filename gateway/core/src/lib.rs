//! Plugin gateway core
//!
//! The gateway lets many client identities read and mutate apps, plugins and
//! the links between them, while confining every identity to an allow-list of
//! observed namespaces. This crate holds the resource-access layer beneath the
//! gateway's REST surface:
//!
//! - [`ClientCache`] maps an identity token to a cluster client and evicts
//!   clients that outlive a maximum age.
//! - [`ObservedNamespaces`] authorizes namespace-scoped operations. Nothing in
//!   this crate reaches a namespace outside the observed set.
//! - [`ResourceCollector`] lists, finds, creates and deletes one resource kind
//!   across the observed namespaces.
//! - [`IngressCoalescer`] merges the paths that independently linked plugins
//!   contribute to a shared ingress, relying on the cluster's
//!   resource-version checks rather than on local locks.
//!
//! The cluster itself is reached only through [`ResourceApi`], which a kube
//! client implements in production and an in-memory store implements in
//! tests.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod api;
pub mod cache;
pub mod collector;
mod error;
pub mod ingress;
mod namespaces;
mod resource_id;

pub use self::{
    api::{ApiError, BoxError, ResourceApi},
    cache::{ClientCache, ClientCacheMetrics, MakeClient, Sweep},
    collector::ResourceCollector,
    error::{Error, FailedPath, PartialFailure, Result},
    ingress::{IngressCoalescer, IngressKey, IngressTarget},
    namespaces::ObservedNamespaces,
    resource_id::ResourceId,
};

/// Bounds the read-modify-write loops that resolve optimistic-concurrency
/// conflicts.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
