//! ApiChecks derived from Ingress annotations
//!
//! Every derived check is keyed by `(namespace, ingress, rule key)`. The key
//! is stored in labels, and the object name is a deterministic function of
//! it, so the set of derived checks can be recomputed from scratch at any
//! time and compared with what exists. Event order does not matter: a late
//! event for an ingress is always re-read first, present ingresses are
//! resynced periodically through their own controller queue, and the sweep
//! removes checks whose ingress is gone.
//!
//! Deleting a derived check only requests deletion; the ApiCheck reconcile
//! loop then removes the Checkly check before the finalizer goes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::conditions::{
    find_condition, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_ANNOTATIONS_VALID, REASON_ANNOTATIONS_PARSED, REASON_INVALID_ANNOTATION,
};
use crate::annotations::{AnnotationScanner, CandidateCheck, IngressSource, RejectedRule, ScanResult};
use crate::crd::{ApiCheck, ResourceStatus};
use crate::error::{Error, Result};
use crate::store::{IngressStore, ResourceStore};

pub const LABEL_INGRESS: &str = "ingress";
pub const LABEL_RULE: &str = "rule";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const MANAGED_BY_INGRESS: &str = "ingress";

const MAX_NAME_LEN: usize = 63;
const HASH_SUFFIX_LEN: usize = 8;

/// Name of the ApiCheck derived from one ingress rule
pub fn derived_name(ingress: &str, rule_key: &str) -> String {
    bounded(&format!("{}-{}", ingress, rule_key).to_lowercase())
}

/// Truncate to 63 chars, keeping uniqueness with a hash suffix
fn bounded(value: &str) -> String {
    if value.len() <= MAX_NAME_LEN {
        return value.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let head: String = value.chars().take(MAX_NAME_LEN - HASH_SUFFIX_LEN - 1).collect();
    format!(
        "{}-{}",
        head.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()),
        &digest[..HASH_SUFFIX_LEN]
    )
}

/// Identity of a derived check: which ingress rule asked for it
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    /// Ingress name as stored in the label (bounded to 63 chars)
    pub ingress: String,
    pub rule: String,
}

impl OwnerKey {
    pub fn new(namespace: &str, ingress: &str, rule: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ingress: bounded(ingress),
            rule: rule.to_string(),
        }
    }
}

/// Derived checks by owner key
#[derive(Clone, Debug, Default)]
pub struct OwnerIndex {
    checks: BTreeMap<OwnerKey, ApiCheck>,
}

impl OwnerIndex {
    pub fn get(&self, key: &OwnerKey) -> Option<&ApiCheck> {
        self.checks.get(key)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Checks owned by one ingress
    pub fn owned_by<'a>(
        &'a self,
        namespace: &'a str,
        ingress: &str,
    ) -> impl Iterator<Item = (&'a OwnerKey, &'a ApiCheck)> + 'a {
        let ingress = bounded(ingress);
        self.checks
            .iter()
            .filter(move |(k, _)| k.namespace == namespace && k.ingress == ingress)
    }
}

/// What a sync pass wants done
#[derive(Clone, Debug, Default)]
pub struct SyncPlan {
    pub create: Vec<ApiCheck>,
    /// Existing objects carrying the new spec and labels
    pub update: Vec<ApiCheck>,
    pub delete: Vec<ApiCheck>,
    /// Existing checks left untouched because their rule's annotations are malformed
    pub held: Vec<(ApiCheck, RejectedRule)>,
    /// Existing checks whose AnnotationsValid condition goes back to True
    pub revalidate: Vec<ApiCheck>,
    pub unchanged: usize,
}

/// Counts of what a sync pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub held: usize,
    pub unchanged: usize,
    /// Writes that lost a resourceVersion race; the pass should be repeated
    pub conflicts: usize,
    /// Derived names already taken by checks this ingress does not own
    pub clashes: usize,
    pub rejected: Vec<RejectedRule>,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// Name of the ingress recorded in the controller ownerReference
fn owner_name(check: &ApiCheck) -> Option<String> {
    check
        .owner_references()
        .iter()
        .find(|r| r.kind == "Ingress")
        .map(|r| r.name.clone())
}

pub struct DerivedResourceSynchronizer {
    scanner: AnnotationScanner,
    store: Arc<dyn ResourceStore<ApiCheck>>,
}

impl DerivedResourceSynchronizer {
    pub fn new(scanner: AnnotationScanner, store: Arc<dyn ResourceStore<ApiCheck>>) -> Self {
        Self { scanner, store }
    }

    pub fn scanner(&self) -> &AnnotationScanner {
        &self.scanner
    }

    /// Selector matching every derived check
    pub fn managed_selector(&self) -> String {
        format!(
            "{}={}",
            self.scanner.key(LABEL_MANAGED_BY),
            MANAGED_BY_INGRESS
        )
    }

    fn owned_selector(&self, ingress: &str) -> String {
        format!(
            "{},{}={}",
            self.managed_selector(),
            self.scanner.key(LABEL_INGRESS),
            bounded(ingress)
        )
    }

    /// Owner key recorded on a derived check
    pub fn owner_key(&self, check: &ApiCheck) -> Option<OwnerKey> {
        let labels = check.labels();
        if labels.get(&self.scanner.key(LABEL_MANAGED_BY)).map(String::as_str)
            != Some(MANAGED_BY_INGRESS)
        {
            return None;
        }
        Some(OwnerKey {
            namespace: check.namespace().unwrap_or_default(),
            ingress: labels.get(&self.scanner.key(LABEL_INGRESS))?.clone(),
            rule: labels.get(&self.scanner.key(LABEL_RULE))?.clone(),
        })
    }

    pub fn index(&self, checks: Vec<ApiCheck>) -> OwnerIndex {
        let checks = checks
            .into_iter()
            .filter_map(|check| self.owner_key(&check).map(|key| (key, check)))
            .collect();
        OwnerIndex { checks }
    }

    fn labels(&self, ingress: &str, rule_key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.scanner.key(LABEL_MANAGED_BY), MANAGED_BY_INGRESS.to_string()),
            (self.scanner.key(LABEL_INGRESS), bounded(ingress)),
            (self.scanner.key(LABEL_RULE), rule_key.to_string()),
        ])
    }

    fn owner_reference(source: &IngressSource) -> Option<OwnerReference> {
        source.uid.as_ref().map(|uid| OwnerReference {
            api_version: "networking.k8s.io/v1".to_string(),
            kind: "Ingress".to_string(),
            name: source.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(false),
        })
    }

    fn desired_check(&self, source: &IngressSource, candidate: &CandidateCheck) -> ApiCheck {
        let mut check = ApiCheck::new(
            &derived_name(&source.name, &candidate.rule_key),
            candidate.spec.clone(),
        );
        check.metadata.namespace = Some(source.namespace.clone());
        check.metadata.labels = Some(self.labels(&source.name, &candidate.rule_key));
        check.metadata.owner_references = Self::owner_reference(source).map(|r| vec![r]);
        check
    }

    /// Diff the scan of one ingress against the checks it currently owns
    ///
    /// Pure: `owned` must hold every derived check labelled for this ingress.
    pub fn plan(&self, source: &IngressSource, scan: &ScanResult, owned: &OwnerIndex) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let existing: BTreeMap<&str, &ApiCheck> = owned
            .owned_by(&source.namespace, &source.name)
            .map(|(key, check)| (key.rule.as_str(), check))
            .collect();

        for candidate in &scan.candidates {
            let desired = self.desired_check(source, candidate);
            let Some(current) = existing.get(candidate.rule_key.as_str()) else {
                plan.create.push(desired);
                continue;
            };
            if current.metadata.deletion_timestamp.is_some() {
                debug!("{} is being deleted, recreating later", current.name_any());
                continue;
            }

            let mut next = (*current).clone();
            next.spec = desired.spec;
            let labels = next.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.extend(desired.metadata.labels.unwrap_or_default());
            // A recreated ingress keeps its name but gets a new uid
            let owner_current = match (&source.uid, &next.metadata.owner_references) {
                (Some(uid), Some(refs)) => refs.iter().any(|r| &r.uid == uid),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !owner_current {
                next.metadata.owner_references = desired.metadata.owner_references;
            }

            if next.spec != current.spec
                || next.metadata.labels != current.metadata.labels
                || next.metadata.owner_references != current.metadata.owner_references
            {
                plan.update.push(next);
            } else {
                plan.unchanged += 1;
            }

            let invalid = current
                .status
                .as_ref()
                .and_then(|s| find_condition(&s.conditions, CONDITION_TYPE_ANNOTATIONS_VALID))
                .is_some_and(|c| c.status == CONDITION_STATUS_FALSE);
            if invalid {
                plan.revalidate.push((*current).clone());
            }
        }

        let held: BTreeSet<&str> = scan
            .rejected
            .iter()
            .filter_map(|rejected| {
                let current = existing.get(rejected.rule_key.as_str())?;
                if current.metadata.deletion_timestamp.is_some() {
                    return None;
                }
                plan.held.push(((*current).clone(), rejected.clone()));
                Some(rejected.rule_key.as_str())
            })
            .collect();

        let wanted = scan.rule_keys();
        for (rule, current) in &existing {
            if wanted.contains(rule) || held.contains(rule) {
                continue;
            }
            if current.metadata.deletion_timestamp.is_none() {
                plan.delete.push((*current).clone());
            }
        }

        plan
    }

    /// Reconcile the derived checks of one present ingress
    pub async fn sync_ingress(&self, source: &IngressSource) -> Result<SyncReport> {
        if source.being_deleted {
            return self.ingress_removed(&source.namespace, &source.name).await;
        }
        let owned = self
            .store
            .list(Some(&source.namespace), &self.owned_selector(&source.name))
            .await?;
        let scan = self.scanner.scan(source);
        let plan = self.plan(source, &scan, &self.index(owned));
        let mut report = self.execute(plan).await?;
        report.rejected = scan.rejected;
        if report.changed() {
            info!(
                "Synced derived checks of ingress {}/{}: {} created, {} updated, {} deleted",
                source.namespace, source.name, report.created, report.updated, report.deleted
            );
        }
        Ok(report)
    }

    /// Request deletion of every check derived from a vanished ingress
    pub async fn ingress_removed(&self, namespace: &str, ingress: &str) -> Result<SyncReport> {
        let owned = self
            .store
            .list(Some(namespace), &self.owned_selector(ingress))
            .await?;
        let plan = SyncPlan {
            delete: owned
                .into_iter()
                .filter(|c| c.metadata.deletion_timestamp.is_none())
                .collect(),
            ..SyncPlan::default()
        };
        let report = self.execute(plan).await?;
        if report.deleted > 0 {
            info!(
                "Ingress {}/{} is gone, deleted {} derived checks",
                namespace, ingress, report.deleted
            );
        }
        Ok(report)
    }

    /// Delete derived checks whose ingress is absent or being deleted
    ///
    /// Checks are listed before ingresses, so a check created by a sync that
    /// raced the listing belongs to an ingress the listing already shows.
    /// Owners missing from the listing are re-read before their checks go.
    /// Rule changes of present ingresses are left to `sync_ingress`.
    pub async fn sweep(&self, ingresses: &dyn IngressStore) -> Result<SyncReport> {
        let index = self.index(self.store.list(None, &self.managed_selector()).await?);
        if index.is_empty() {
            #[cfg(feature = "metrics")]
            super::metrics::set_derived_checks(0);
            return Ok(SyncReport::default());
        }

        let present: BTreeSet<(String, String)> = ingresses
            .list()
            .await?
            .into_iter()
            .filter(|source| !source.being_deleted)
            .map(|source| (source.namespace, bounded(&source.name)))
            .collect();

        let mut owners_gone: BTreeMap<(String, String), bool> = BTreeMap::new();
        let mut plan = SyncPlan::default();
        for (key, check) in index.checks.iter() {
            if check.metadata.deletion_timestamp.is_some()
                || present.contains(&(key.namespace.clone(), key.ingress.clone()))
            {
                continue;
            }

            let owner = (
                key.namespace.clone(),
                owner_name(check).unwrap_or_else(|| key.ingress.clone()),
            );
            let gone = match owners_gone.get(&owner) {
                Some(gone) => *gone,
                None => {
                    let gone = ingresses
                        .get(&owner.0, &owner.1)
                        .await?
                        .map_or(true, |source| source.being_deleted);
                    owners_gone.insert(owner.clone(), gone);
                    gone
                }
            };
            if gone {
                debug!("Derived check {}/{} lost its ingress", key.namespace, check.name_any());
                plan.delete.push(check.clone());
            } else {
                debug!("Ingress {}/{} appeared after the listing", owner.0, owner.1);
            }
        }

        let report = self.execute(plan).await?;

        #[cfg(feature = "metrics")]
        super::metrics::set_derived_checks(index.len().saturating_sub(report.deleted) as i64);

        Ok(report)
    }

    async fn execute(&self, plan: SyncPlan) -> Result<SyncReport> {
        let mut report = SyncReport {
            unchanged: plan.unchanged,
            ..SyncReport::default()
        };

        for check in plan.create {
            match self.store.create(&check).await {
                Ok(_) => {
                    info!("Created derived check {}", check.name_any());
                    report.created += 1;
                }
                Err(Error::Conflict(_)) => {
                    warn!(
                        "ApiCheck {} already exists and is not derived from this ingress rule",
                        check.name_any()
                    );
                    report.clashes += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut replaced = BTreeMap::new();
        for check in plan.update {
            match self.store.replace(&check).await {
                Ok(updated) => {
                    info!("Updated derived check {}", check.name_any());
                    report.updated += 1;
                    replaced.insert(updated.name_any(), updated);
                }
                Err(Error::Conflict(_)) => report.conflicts += 1,
                Err(e) => return Err(e),
            }
        }

        for check in plan.delete {
            let namespace = check.namespace().unwrap_or_default();
            self.store.delete(&namespace, &check.name_any()).await?;
            info!("Deleted derived check {}/{}", namespace, check.name_any());
            report.deleted += 1;
        }

        for (check, rejected) in plan.held {
            warn!(
                "Holding derived check {}: {} is invalid: {}",
                check.name_any(),
                rejected.annotation,
                rejected.message
            );
            let message = format!("{}: {}", rejected.annotation, rejected.message);
            let written = self
                .set_annotations_valid(&check, false, REASON_INVALID_ANNOTATION, &message)
                .await?;
            report.conflicts += usize::from(!written);
            report.held += 1;
        }

        for check in plan.revalidate {
            let check = replaced.remove(&check.name_any()).unwrap_or(check);
            let written = self
                .set_annotations_valid(
                    &check,
                    true,
                    REASON_ANNOTATIONS_PARSED,
                    "All annotations parsed",
                )
                .await?;
            report.conflicts += usize::from(!written);
        }

        Ok(report)
    }

    /// Returns false when the write lost a version race
    async fn set_annotations_valid(
        &self,
        check: &ApiCheck,
        valid: bool,
        reason: &str,
        message: &str,
    ) -> Result<bool> {
        let mut status: ResourceStatus = check.status.clone().unwrap_or_default();
        let status_value = if valid {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        };
        let changed = set_condition(
            &mut status.conditions,
            CONDITION_TYPE_ANNOTATIONS_VALID,
            status_value,
            reason,
            message,
            check.metadata.generation,
        );
        if !changed {
            return Ok(true);
        }
        match self.store.patch_status(check, &status).await {
            Ok(_) => Ok(true),
            Err(Error::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
