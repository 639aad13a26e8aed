//! Generic reconcile loop shared by ApiCheck, Group and AlertChannel
//!
//! One `ReconcileLoop` is built per kind with the kind's mapper. Every
//! invocation starts from a fresh read of the object and is safe to repeat:
//!
//! 1. Deleting with our finalizer: delete the Checkly resource (404 counts as
//!    done), clear `status.externalId`, then drop the finalizer.
//! 2. Finalizer missing: add it before any external write.
//! 3. Map the spec. Invalid specs get `Ready=False, InvalidSpec` and are not
//!    looked at again until the generation moves. Unresolved references get
//!    `Ready=False, DependencyPending` and a fixed requeue.
//! 4. No external id: create and record the id. Otherwise read, compare the
//!    projection with the desired representation and update only on a diff.
//!
//! Failed invocations only touch conditions and phase, never the external id
//! or the observed generation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use super::backoff::BackoffTracker;
use super::conditions::{
    invalid_for_generation, is_condition_true, set_ready, CONDITION_TYPE_READY,
    REASON_DEPENDENCY_PENDING, REASON_INVALID_SPEC, REASON_SYNCED,
};
use super::finalizers::FinalizerManager;
use crate::checkly::{ApiError, ChecklyApi};
use crate::crd::{ManagedResource, ResourceKind, ResourceStatus, SpecValidationError, SyncPhase};
use crate::error::{Error, Result, Stage};
use crate::mapper::{spec_hash, Dependencies, MapError, ResourceMapper};
use crate::store::{DependencySource, ResourceStore};

/// Fixed requeue for requests Checkly rejected
pub const REJECTED_REQUEUE: Duration = Duration::from_secs(300);

/// Namespaced identity of a watched object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-loop settings, built from the operator configuration
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub finalizer: String,
    /// Periodic resync; also bounds how long a verified state is trusted
    pub resync_interval: Duration,
    /// Requeue delay while a referenced resource is not synced
    pub dependency_retry: Duration,
    /// Immediate retries after a version conflict before backing off
    pub max_conflict_retries: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            finalizer: "k8s.checklyhq.com/finalizer".to_string(),
            resync_interval: Duration::from_secs(300),
            dependency_retry: Duration::from_secs(30),
            max_conflict_retries: 3,
        }
    }
}

/// Serializes invocations per object key
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn forget(&self, key: &ObjectKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(key);
        }
    }
}

/// Phase of an object whose desired state has not reached Checkly
fn unsynced_phase(status: &ResourceStatus) -> SyncPhase {
    if status.external_id.is_none() {
        SyncPhase::Pending
    } else {
        SyncPhase::Syncing
    }
}

pub struct ReconcileLoop<M: ResourceMapper> {
    kind: ResourceKind,
    mapper: M,
    api: Arc<dyn ChecklyApi>,
    store: Arc<dyn ResourceStore<M::Resource>>,
    dependencies: Arc<dyn DependencySource>,
    finalizers: FinalizerManager<M::Resource>,
    config: LoopConfig,
    locks: KeyLocks,
    verified: Mutex<HashMap<ObjectKey, Instant>>,
    backoff: BackoffTracker,
}

impl<M: ResourceMapper> ReconcileLoop<M> {
    pub fn new(
        mapper: M,
        api: Arc<dyn ChecklyApi>,
        store: Arc<dyn ResourceStore<M::Resource>>,
        dependencies: Arc<dyn DependencySource>,
        config: LoopConfig,
    ) -> Self {
        Self {
            kind: <M::Resource as ManagedResource>::KIND,
            mapper,
            api,
            finalizers: FinalizerManager::new(config.finalizer.clone(), store.clone()),
            store,
            dependencies,
            config,
            locks: KeyLocks::default(),
            verified: Mutex::new(HashMap::new()),
            backoff: BackoffTracker::default(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Bring one object in line with Checkly
    #[instrument(skip(self), fields(kind = %self.kind, namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let _guard = self.locks.lock(key).await;

        let Some(obj) = self.store.get(&key.namespace, &key.name).await? else {
            debug!("{} {} no longer exists", self.kind, key);
            self.forget(key);
            return Ok(Action::await_change());
        };

        if FinalizerManager::is_being_deleted(&obj) {
            return self.finalize(key, obj).await;
        }

        let obj = self.finalizers.add(&obj).await?;
        self.apply(key, obj).await
    }

    /// Requeue decision after a failed invocation
    pub fn error_policy(&self, key: &ObjectKey, error: &Error) -> Action {
        let conflict = matches!(
            error,
            Error::Conflict(_)
                | Error::Checkly {
                    source: ApiError::Conflict(_),
                    ..
                }
        );
        if conflict {
            let attempts = self.backoff.record_conflict(key);
            if attempts <= self.config.max_conflict_retries {
                debug!("Conflict on {}, retrying immediately ({})", key, attempts);
                return Action::requeue(Duration::ZERO);
            }
        }

        if error.is_retriable() {
            let delay = self.backoff.next_delay(key);
            warn!(
                "Reconcile of {} {} failed ({}), retrying in {:?}",
                self.kind,
                key,
                error.reason(),
                delay
            );
            return Action::requeue(delay);
        }

        match error {
            Error::Checkly { .. } => {
                warn!("Checkly rejected {} {}: {}", self.kind, key, error);
                Action::requeue(REJECTED_REQUEUE)
            }
            _ => {
                warn!("Reconcile of {} {} failed permanently: {}", self.kind, key, error);
                Action::await_change()
            }
        }
    }

    async fn finalize(&self, key: &ObjectKey, obj: M::Resource) -> Result<Action> {
        if !self.finalizers.has(&obj) {
            self.forget(key);
            return Ok(Action::await_change());
        }

        let obj = match obj.external_id().map(str::to_string) {
            Some(id) => {
                if let Err(err) = self.delete_external(&id).await {
                    self.record_failure(&obj, &err).await;
                    return Err(err);
                }
                info!(external_id = %id, "Deleted {} from Checkly", self.kind);
                self.persist_status(&obj, |status| {
                    status.external_id = None;
                    status.spec_hash = None;
                    status.phase = SyncPhase::Gone;
                })
                .await?
            }
            None => obj,
        };

        self.finalizers.remove(&obj).await?;
        self.forget(key);
        Ok(Action::await_change())
    }

    async fn delete_external(&self, id: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = self.api.delete(self.kind, id).await;
            self.track("delete", &result);
            match result {
                Ok(()) => return Ok(()),
                Err(ApiError::NotFound) => {
                    debug!(external_id = %id, "Already gone from Checkly");
                    return Ok(());
                }
                Err(ApiError::Conflict(_)) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                }
                Err(e) => return Err(Error::checkly(Stage::Deleting, e)),
            }
        }
    }

    async fn apply(&self, key: &ObjectKey, obj: M::Resource) -> Result<Action> {
        let generation = obj.meta().generation;
        let status = obj.managed_status().cloned().unwrap_or_default();

        if invalid_for_generation(&status.conditions, generation) {
            debug!("Generation {:?} already failed validation", generation);
            return Ok(Action::await_change());
        }

        let dependencies = self.resolve_dependencies(&obj).await?;
        let desired = match self.mapper.to_external(&obj, &dependencies) {
            Ok(desired) => desired,
            Err(MapError::Invalid(e)) => return self.reject_spec(&obj, e).await,
            Err(MapError::Pending(what)) => return self.wait_for(&obj, &what).await,
        };
        let hash = spec_hash(&desired)?;
        let body = serde_json::to_value(&desired)?;

        let result = match status.external_id.as_deref() {
            None => self.create(key, &obj, &body, &hash).await,
            Some(id) => self.sync_existing(key, &obj, id, &desired, &body, &hash).await,
        };

        match result {
            Ok(()) => {
                self.backoff.reset(key);
                Ok(Action::requeue(self.config.resync_interval))
            }
            Err(err) => {
                self.record_failure(&obj, &err).await;
                Err(err)
            }
        }
    }

    async fn resolve_dependencies(&self, obj: &M::Resource) -> Result<Dependencies> {
        let namespace = obj.namespace().unwrap_or_default();
        let mut resolved = Dependencies::default();
        for dependency in self.mapper.dependencies(obj) {
            if let Some(value) = self.dependencies.resolve(&namespace, &dependency).await? {
                resolved.insert(dependency, value);
            }
        }
        Ok(resolved)
    }

    async fn create(&self, key: &ObjectKey, obj: &M::Resource, body: &Value, hash: &str) -> Result<()> {
        let result = self.api.create(self.kind, body).await;
        self.track("create", &result);
        let id = result.map_err(|e| Error::checkly(Stage::Creating, e))?;
        info!(external_id = %id, "Created {} in Checkly", self.kind);
        self.mark_synced(key, obj, &id, hash).await
    }

    async fn sync_existing(
        &self,
        key: &ObjectKey,
        obj: &M::Resource,
        id: &str,
        desired: &M::Representation,
        body: &Value,
        hash: &str,
    ) -> Result<()> {
        let status = obj.managed_status().cloned().unwrap_or_default();
        if status.observed_generation == obj.meta().generation
            && status.spec_hash.as_deref() == Some(hash)
            && is_condition_true(&status.conditions, CONDITION_TYPE_READY)
            && self.recently_verified(key)
        {
            debug!(external_id = %id, "Already in sync");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            let result = self.api.read(self.kind, id).await;
            self.track("read", &result);
            let observed = match result {
                Ok(observed) => observed,
                Err(ApiError::NotFound) => {
                    warn!(external_id = %id, "{} vanished from Checkly, recreating", self.kind);
                    return self.create(key, obj, body, hash).await;
                }
                Err(e) => return Err(Error::checkly(Stage::Reading, e)),
            };

            let in_sync = match self.mapper.from_external(&observed) {
                Ok(current) => current == *desired,
                Err(e) => {
                    debug!("Unexpected Checkly representation, overwriting: {}", e);
                    false
                }
            };
            if in_sync {
                return self.mark_synced(key, obj, id, hash).await;
            }

            let result = self.api.update(self.kind, id, body).await;
            self.track("update", &result);
            match result {
                Ok(()) => {
                    info!(external_id = %id, "Updated {} in Checkly", self.kind);
                    return self.mark_synced(key, obj, id, hash).await;
                }
                Err(ApiError::Conflict(message)) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(external_id = %id, "Update conflicted ({}), re-reading", message);
                }
                Err(ApiError::NotFound) => {
                    warn!(external_id = %id, "{} vanished from Checkly, recreating", self.kind);
                    return self.create(key, obj, body, hash).await;
                }
                Err(e) => return Err(Error::checkly(Stage::Updating, e)),
            }
        }
    }

    async fn mark_synced(&self, key: &ObjectKey, obj: &M::Resource, id: &str, hash: &str) -> Result<()> {
        let generation = obj.meta().generation;
        let message = format!("{} {} is in sync", self.kind, id);
        self.persist_status(obj, |status| {
            status.external_id = Some(id.to_string());
            status.observed_generation = generation;
            status.spec_hash = Some(hash.to_string());
            status.phase = SyncPhase::Synced;
            set_ready(&mut status.conditions, true, REASON_SYNCED, &message, generation);
        })
        .await?;
        self.verified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), Instant::now());
        Ok(())
    }

    async fn reject_spec(&self, obj: &M::Resource, error: SpecValidationError) -> Result<Action> {
        warn!(field = %error.field, "Invalid spec: {}", error.message);
        let generation = obj.meta().generation;
        let message = format!("{}; {}", error, error.how_to_fix);
        self.persist_status(obj, |status| {
            status.phase = unsynced_phase(status);
            set_ready(&mut status.conditions, false, REASON_INVALID_SPEC, &message, generation);
        })
        .await?;
        Ok(Action::await_change())
    }

    async fn wait_for(&self, obj: &M::Resource, what: &str) -> Result<Action> {
        info!("Waiting for {}", what);
        let generation = obj.meta().generation;
        let message = format!("Waiting for {} to be synced", what);
        self.persist_status(obj, |status| {
            status.phase = unsynced_phase(status);
            set_ready(
                &mut status.conditions,
                false,
                REASON_DEPENDENCY_PENDING,
                &message,
                generation,
            );
        })
        .await?;
        Ok(Action::requeue(self.config.dependency_retry))
    }

    /// Surface a failure through conditions and phase only
    async fn record_failure(&self, obj: &M::Resource, error: &Error) {
        let generation = obj.meta().generation;
        let deleting = FinalizerManager::is_being_deleted(obj);
        // Only a failed correction of an observed diff leaves the object drifted
        let correction_failed = matches!(
            error,
            Error::Checkly {
                stage: Stage::Updating,
                ..
            }
        );
        let reason = error.reason();
        let message = error.to_string();
        let result = self
            .persist_status(obj, |status| {
                status.phase = if deleting {
                    SyncPhase::Deleting
                } else if correction_failed
                    && status.external_id.is_some()
                    && status.observed_generation == generation
                {
                    SyncPhase::Drifted
                } else {
                    unsynced_phase(status)
                };
                set_ready(&mut status.conditions, false, reason, &message, generation);
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to record failure on {}: {}", obj.name_any(), e);
        }
    }

    /// Write the status if `mutate` changes it, re-reading on version conflicts
    async fn persist_status<F>(&self, obj: &M::Resource, mutate: F) -> Result<M::Resource>
    where
        F: Fn(&mut ResourceStatus) + Send + Sync,
    {
        let mut current = obj.clone();
        let mut attempt = 0;
        loop {
            let before = current.managed_status().cloned().unwrap_or_default();
            let mut after = before.clone();
            mutate(&mut after);
            if current.managed_status().is_some() && after == before {
                return Ok(current);
            }

            match self.store.patch_status(&current, &after).await {
                Ok(updated) => return Ok(updated),
                Err(Error::Conflict(message)) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!("Status write conflicted ({}), re-reading", message);
                    let key = ObjectKey::of(&current);
                    current = self
                        .store
                        .get(&key.namespace, &key.name)
                        .await?
                        .ok_or(Error::Conflict(message))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn recently_verified(&self, key: &ObjectKey) -> bool {
        self.verified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .is_some_and(|at| at.elapsed() < self.config.resync_interval)
    }

    fn forget(&self, key: &ObjectKey) {
        self.verified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.backoff.reset(key);
        self.locks.forget(key);
    }

    #[allow(unused_variables)]
    fn track<T>(&self, operation: &str, result: &std::result::Result<T, ApiError>) {
        #[cfg(feature = "metrics")]
        super::metrics::observe_external_call(self.kind, operation, result.as_ref().err());
    }
}
