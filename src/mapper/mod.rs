//! Translation between resource specs and Checkly API representations
//!
//! Mappers are pure: they never perform I/O. References to other resources
//! (a check's group, a group's alert channels, an alert channel's secret) are
//! declared through [`ResourceMapper::dependencies`], resolved by the loop, and
//! handed back in a [`Dependencies`] value.
//!
//! Serialization of a representation is deterministic (struct field order,
//! sorted lists), so the sha256 of the serialized form identifies the desired
//! state and enables no-op detection.

mod alert_channel;
mod check;
mod group;

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crd::{ManagedResource, SpecValidationError};

pub use alert_channel::{AlertChannelConfigPayload, AlertChannelMapper, AlertChannelPayload};
pub use check::{parse_frequency, AssertionPayload, CheckMapper, CheckPayload, CheckRequest, Frequency};
pub use group::{AlertChannelSubscription, GroupMapper, GroupPayload};

/// Reference from one resource to another object in the same namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    Group(String),
    AlertChannel(String),
    SecretKey { name: String, key: String },
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::Group(name) => write!(f, "Group {}", name),
            Dependency::AlertChannel(name) => write!(f, "AlertChannel {}", name),
            Dependency::SecretKey { name, key } => write!(f, "Secret {} key {}", name, key),
        }
    }
}

/// Resolved values for the dependencies of one resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependencies {
    resolved: BTreeMap<Dependency, String>,
}

impl Dependencies {
    pub fn insert(&mut self, dependency: Dependency, value: impl Into<String>) {
        self.resolved.insert(dependency, value.into());
    }

    pub fn with(mut self, dependency: Dependency, value: impl Into<String>) -> Self {
        self.insert(dependency, value);
        self
    }

    pub fn get(&self, dependency: &Dependency) -> Option<&str> {
        self.resolved.get(dependency).map(String::as_str)
    }

    /// Resolved value or `MapError::Pending` naming the dependency
    pub fn require(&self, dependency: Dependency) -> Result<&str, MapError> {
        match self.resolved.get(&dependency) {
            Some(value) => Ok(value.as_str()),
            None => Err(MapError::Pending(dependency.to_string())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MapError {
    /// The spec cannot be expressed in Checkly
    #[error(transparent)]
    Invalid(#[from] SpecValidationError),

    /// A referenced resource is not synced yet
    #[error("waiting for {0}")]
    Pending(String),
}

/// Per-kind translation between a resource and its Checkly representation
pub trait ResourceMapper: Send + Sync + 'static {
    type Resource: ManagedResource;
    type Representation: Serialize + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync;

    /// Other objects whose external ids or values the mapping needs
    fn dependencies(&self, _resource: &Self::Resource) -> Vec<Dependency> {
        Vec::new()
    }

    /// Desired external representation of the resource
    fn to_external(
        &self,
        resource: &Self::Resource,
        dependencies: &Dependencies,
    ) -> Result<Self::Representation, MapError>;

    /// Bring an observed representation into the canonical form `to_external` produces
    fn normalize(&self, representation: Self::Representation) -> Self::Representation {
        representation
    }

    /// Project an observed Checkly document onto the managed fields
    ///
    /// Fields Checkly adds on its side (ids, timestamps, defaults for
    /// unmanaged settings) are dropped, so equality with the desired
    /// representation means "in sync".
    fn from_external(&self, observed: &Value) -> Result<Self::Representation, serde_json::Error> {
        let representation = serde_json::from_value(observed.clone())?;
        Ok(self.normalize(representation))
    }
}

/// Hex sha256 over the serialized representation
pub fn spec_hash<R: Serialize>(representation: &R) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(representation)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Sorted, de-duplicated, trimmed list with empty entries removed
pub(crate) fn canonical_list(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// External id of a group or alert channel, which Checkly keys by integer
pub(crate) fn numeric_id(dependency: &str, value: &str) -> Result<i64, MapError> {
    value.parse::<i64>().map_err(|_| {
        MapError::Invalid(SpecValidationError::new(
            dependency,
            format!("external id '{}' is not numeric", value),
            "recreate the referenced resource so it receives a new id",
        ))
    })
}
