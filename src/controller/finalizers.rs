//! Finalizer handling for mirrored resources
//!
//! The finalizer is persisted on the object itself, so the guarantee that
//! the Checkly resource is deleted before the object disappears survives
//! operator restarts:
//! 1. The finalizer is added before the first external create
//! 2. On deletion the external resource is removed and `status.externalId` cleared
//! 3. Only then is the finalizer removed, letting the API server drop the object

use std::sync::Arc;

use kube::ResourceExt;
use tracing::info;

use crate::crd::ManagedResource;
use crate::error::Result;
use crate::store::ResourceStore;

/// Finalizer name for a controller domain
pub fn finalizer_name(domain: &str) -> String {
    format!("{}/finalizer", domain.trim_end_matches('/'))
}

/// Add, remove and inspect the operator's finalizer on one kind
pub struct FinalizerManager<K: ManagedResource> {
    name: String,
    store: Arc<dyn ResourceStore<K>>,
}

impl<K: ManagedResource> FinalizerManager<K> {
    pub fn new(name: impl Into<String>, store: Arc<dyn ResourceStore<K>>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// Check if the object has our finalizer
    pub fn has(&self, obj: &K) -> bool {
        obj.finalizers().iter().any(|f| f == &self.name)
    }

    /// A deletion timestamp means deletion was requested and finalizers hold the object
    pub fn is_being_deleted(obj: &K) -> bool {
        obj.meta().deletion_timestamp.is_some()
    }

    /// Add the finalizer if absent, returning the updated object
    pub async fn add(&self, obj: &K) -> Result<K> {
        if self.has(obj) {
            return Ok(obj.clone());
        }
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(self.name.clone());
        let updated = self.store.patch_finalizers(obj, &finalizers).await?;
        info!("Added finalizer to {} {}", K::KIND, obj.name_any());
        Ok(updated)
    }

    /// Remove the finalizer; the object may be gone from the store afterwards
    pub async fn remove(&self, obj: &K) -> Result<()> {
        if !self.has(obj) {
            return Ok(());
        }
        let finalizers: Vec<String> = obj
            .finalizers()
            .iter()
            .filter(|f| *f != &self.name)
            .cloned()
            .collect();
        self.store.patch_finalizers(obj, &finalizers).await?;
        info!("Removed finalizer from {} {}", K::KIND, obj.name_any());
        Ok(())
    }
}
