//! In-memory fakes of the Checkly API, the cluster store, ingress reads and
//! dependency lookup

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::annotations::IngressSource;
use crate::checkly::{ApiError, ChecklyApi};
use crate::crd::{ManagedResource, ResourceKind, ResourceStatus};
use crate::error::{Error, Result};
use crate::mapper::Dependency;
use crate::store::{DependencySource, IngressStore, ResourceStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiCall {
    pub op: Op,
    pub kind: ResourceKind,
    pub id: Option<String>,
}

#[derive(Default)]
struct FakeApiState {
    resources: BTreeMap<(ResourceKind, String), Value>,
    calls: Vec<ApiCall>,
    failures: HashMap<Op, VecDeque<ApiError>>,
    next_id: u64,
}

/// Checkly stand-in that records every call
///
/// Check ids are `ext-<n>`; groups and alert channels get numeric ids the way
/// Checkly hands them out.
#[derive(Default)]
pub struct FakeChecklyApi {
    state: Mutex<FakeApiState>,
}

impl FakeChecklyApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` call fail with `error`
    pub fn fail_next(&self, op: Op, error: ApiError) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<ApiCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Calls other than reads
    pub fn writes(&self) -> Vec<ApiCall> {
        self.calls().into_iter().filter(|c| c.op != Op::Read).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn resource(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(&(kind, id.to_string()))
            .cloned()
    }

    pub fn resource_count(&self, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .resources
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Simulate an edit made in the Checkly UI
    pub fn edit_remote(&self, kind: ResourceKind, id: &str, edit: impl FnOnce(&mut Value)) {
        let mut state = self.state.lock().unwrap();
        if let Some(doc) = state.resources.get_mut(&(kind, id.to_string())) {
            edit(doc);
        }
    }

    /// Simulate a deletion made outside the operator
    pub fn remove_remote(&self, kind: ResourceKind, id: &str) {
        self.state
            .lock()
            .unwrap()
            .resources
            .remove(&(kind, id.to_string()));
    }

    fn record(&self, op: Op, kind: ResourceKind, id: Option<&str>) -> Option<ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall {
            op,
            kind,
            id: id.map(str::to_string),
        });
        state.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ChecklyApi for FakeChecklyApi {
    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<String, ApiError> {
        if let Some(err) = self.record(Op::Create, kind, None) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = match kind {
            ResourceKind::Check => format!("ext-{}", state.next_id),
            _ => state.next_id.to_string(),
        };
        state.resources.insert((kind, id.clone()), body.clone());
        Ok(id)
    }

    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, ApiError> {
        if let Some(err) = self.record(Op::Read, kind, Some(id)) {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        let mut doc = state
            .resources
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or(ApiError::NotFound)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
            obj.insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
        }
        Ok(doc)
    }

    async fn update(&self, kind: ResourceKind, id: &str, body: &Value) -> Result<(), ApiError> {
        if let Some(err) = self.record(Op::Update, kind, Some(id)) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        match state.resources.get_mut(&(kind, id.to_string())) {
            Some(doc) => {
                *doc = body.clone();
                Ok(())
            }
            None => Err(ApiError::NotFound),
        }
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ApiError> {
        if let Some(err) = self.record(Op::Delete, kind, Some(id)) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state
            .resources
            .remove(&(kind, id.to_string()))
            .map(|_| ())
            .ok_or(ApiError::NotFound)
    }
}

struct StoreState<K> {
    objects: BTreeMap<(String, String), K>,
    removed: Vec<K>,
    next_rv: u64,
    next_uid: u64,
}

/// Cluster store stand-in with resourceVersion checks and finalizer-gated deletion
pub struct MemoryStore<K> {
    state: Mutex<StoreState<K>>,
    status_writes: AtomicUsize,
    status_conflicts: AtomicUsize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState {
                objects: BTreeMap::new(),
                removed: Vec::new(),
                next_rv: 0,
                next_uid: 0,
            }),
            status_writes: AtomicUsize::new(0),
            status_conflicts: AtomicUsize::new(0),
        }
    }
}

fn key_of<K: ManagedResource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn spec_of<K: ManagedResource>(obj: &K) -> Value {
    serde_json::to_value(obj)
        .ok()
        .and_then(|v| v.get("spec").cloned())
        .unwrap_or(Value::Null)
}

fn stale(obj_rv: Option<String>, current_rv: Option<String>) -> bool {
    obj_rv.is_some() && obj_rv != current_rv
}

fn matches_selector<K: ManagedResource>(obj: &K, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

impl<K: ManagedResource> MemoryStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(state: &mut StoreState<K>, obj: &mut K) {
        state.next_rv += 1;
        obj.meta_mut().resource_version = Some(state.next_rv.to_string());
    }

    /// Seed an object as if a user had applied it
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        state.next_uid += 1;
        let uid = format!("uid-{}", state.next_uid);
        let meta = obj.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(1));
        meta.uid.get_or_insert(uid);
        Self::bump(&mut state, &mut obj);
        state.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn all(&self) -> Vec<K> {
        self.state.lock().unwrap().objects.values().cloned().collect()
    }

    /// Objects physically removed after their finalizers were cleared
    pub fn removed(&self) -> Vec<K> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Simulate a user edit of the object; bumps generation when the spec changes
    pub fn edit(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut K)) -> Option<K> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let mut obj = state.objects.get(&key)?.clone();
        let before = spec_of(&obj);
        edit(&mut obj);
        if spec_of(&obj) != before {
            let meta = obj.meta_mut();
            meta.generation = Some(meta.generation.unwrap_or(1) + 1);
        }
        Self::bump(&mut state, &mut obj);
        state.objects.insert(key, obj.clone());
        Some(obj)
    }

    /// Number of successful status writes
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` status writes fail as if a concurrent writer won
    pub fn inject_status_conflicts(&self, n: usize) {
        self.status_conflicts.store(n, Ordering::SeqCst);
    }

    fn store_or_remove(state: &mut StoreState<K>, obj: K) -> K {
        let key = key_of(&obj);
        if obj.meta().deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            state.objects.remove(&key);
            state.removed.push(obj.clone());
        } else {
            state.objects.insert(key, obj.clone());
        }
        obj
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.current(namespace, name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|o| namespace.map_or(true, |ns| o.namespace().as_deref() == Some(ns)))
            .filter(|o| matches_selector(o, label_selector))
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        if self.current(&obj.namespace().unwrap_or_default(), &obj.name_any()).is_some() {
            return Err(Error::Conflict(format!("{} already exists", obj.name_any())));
        }
        let mut fresh = obj.clone();
        fresh.meta_mut().resource_version = None;
        fresh.meta_mut().generation = Some(1);
        Ok(self.insert(fresh))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::ConfigError(format!("{} not found", obj.name_any())));
        };
        if stale(obj.resource_version(), current.resource_version()) {
            return Err(Error::Conflict("the object has been modified".to_string()));
        }
        let mut next = obj.clone();
        *next.managed_status_mut() = current.managed_status().cloned();
        next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        next.meta_mut().uid = current.meta().uid.clone();
        let generation = current.meta().generation.unwrap_or(1);
        next.meta_mut().generation = Some(if spec_of(&next) != spec_of(&current) {
            generation + 1
        } else {
            generation
        });
        Self::bump(&mut state, &mut next);
        Ok(Self::store_or_remove(&mut state, next))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(mut obj) = state.objects.get(&key).cloned() else {
            return Ok(());
        };
        if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            Self::bump(&mut state, &mut obj);
        }
        Self::store_or_remove(&mut state, obj);
        Ok(())
    }

    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<K> {
        if self
            .status_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Conflict("injected status conflict".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let Some(mut current) = state.objects.get(&key_of(obj)).cloned() else {
            return Err(Error::ConfigError(format!("{} not found", obj.name_any())));
        };
        if stale(obj.resource_version(), current.resource_version()) {
            return Err(Error::Conflict("the object has been modified".to_string()));
        }
        *current.managed_status_mut() = Some(status.clone());
        Self::bump(&mut state, &mut current);
        state.objects.insert(key_of(&current), current.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(current)
    }

    async fn patch_finalizers(&self, obj: &K, finalizers: &[String]) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let Some(mut current) = state.objects.get(&key_of(obj)).cloned() else {
            return Err(Error::ConfigError(format!("{} not found", obj.name_any())));
        };
        if stale(obj.resource_version(), current.resource_version()) {
            return Err(Error::Conflict("the object has been modified".to_string()));
        }
        current.meta_mut().finalizers = Some(finalizers.to_vec());
        Self::bump(&mut state, &mut current);
        Ok(Self::store_or_remove(&mut state, current))
    }
}

/// Dependency lookup backed by a map
#[derive(Default)]
pub struct FakeDependencies {
    values: Mutex<BTreeMap<Dependency, String>>,
}

impl FakeDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, dependency: Dependency, value: impl Into<String>) {
        self.values.lock().unwrap().insert(dependency, value.into());
    }
}

#[async_trait]
impl DependencySource for FakeDependencies {
    async fn resolve(&self, _namespace: &str, dependency: &Dependency) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(dependency).cloned())
    }
}

/// Ingresses held in memory; the listing can be pinned to an older snapshot
#[derive(Default)]
pub struct MemoryIngresses {
    current: Mutex<BTreeMap<(String, String), IngressSource>>,
    pinned_listing: Mutex<Option<Vec<IngressSource>>>,
}

impl MemoryIngresses {
    pub fn new(ingresses: impl IntoIterator<Item = IngressSource>) -> Self {
        let fake = Self::default();
        for ingress in ingresses {
            fake.put(ingress);
        }
        fake
    }

    pub fn put(&self, ingress: IngressSource) {
        self.current
            .lock()
            .unwrap()
            .insert((ingress.namespace.clone(), ingress.name.clone()), ingress);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.current
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Make `list` return `snapshot` while `get` keeps reading current state
    pub fn pin_listing(&self, snapshot: Vec<IngressSource>) {
        *self.pinned_listing.lock().unwrap() = Some(snapshot);
    }
}

#[async_trait]
impl IngressStore for MemoryIngresses {
    async fn list(&self) -> Result<Vec<IngressSource>> {
        if let Some(snapshot) = self.pinned_listing.lock().unwrap().clone() {
            return Ok(snapshot);
        }
        Ok(self.current.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<IngressSource>> {
        Ok(self
            .current
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
