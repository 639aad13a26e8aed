//! Boundary to the cluster store
//!
//! The persisted object is the single source of truth. Every write carries the
//! object's `resourceVersion`; a stale write fails with `Error::Conflict` and
//! the caller re-reads instead of overwriting a concurrent edit.

mod kube_store;

use async_trait::async_trait;

use crate::annotations::IngressSource;
use crate::crd::{ManagedResource, ResourceStatus};
use crate::error::Result;
use crate::mapper::Dependency;

pub use kube_store::{KubeDependencySource, KubeIngressStore, KubeStore};

#[async_trait]
pub trait ResourceStore<K: ManagedResource>: Send + Sync {
    /// Fresh read; `None` once the object is physically gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching a label selector, across namespaces when `namespace` is `None`
    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>>;

    /// Create; `Error::Conflict` when an object with that name already exists
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec, guarded by `obj`'s resourceVersion
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Request deletion; finalizers keep the object around until removed
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the status subresource, guarded by `obj`'s resourceVersion
    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<K>;

    /// Write the finalizer list, guarded by `obj`'s resourceVersion
    async fn patch_finalizers(&self, obj: &K, finalizers: &[String]) -> Result<K>;
}

/// Resolves references between resources
#[async_trait]
pub trait DependencySource: Send + Sync {
    /// External id (or secret value) of the dependency, `None` when not available yet
    async fn resolve(&self, namespace: &str, dependency: &Dependency) -> Result<Option<String>>;
}

/// Read access to Ingresses, as seen by the annotation scanner
#[async_trait]
pub trait IngressStore: Send + Sync {
    /// Every ingress in the cluster
    async fn list(&self) -> Result<Vec<IngressSource>>;

    /// Fresh read; `None` once the ingress is physically gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<IngressSource>>;
}
