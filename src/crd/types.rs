//! Shared types used by all Checkly custom resources

use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Closed set of resource kinds mirrored into Checkly
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Check,
    Group,
    AlertChannel,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Check => "check",
            ResourceKind::Group => "group",
            ResourceKind::AlertChannel => "alertchannel",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured validation error for resource specs and annotations
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

/// Lifecycle phase of a mirrored resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SyncPhase {
    /// No external resource exists yet
    #[default]
    Pending,
    /// The spec changed and has not been pushed yet
    Syncing,
    /// External resource matches the spec
    Synced,
    /// External resource diverged and the last correction failed
    Drifted,
    /// Deletion requested; external cleanup in progress
    Deleting,
    /// External resource removed
    Gone,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kubernetes-style condition
///
/// ```rust
/// use checkly_operator::crd::Condition;
///
/// let condition = Condition::ready(true, "Synced", "Check is in sync");
/// assert_eq!(condition.status, "True");
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "AnnotationsValid")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation the condition was computed from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Set the observed generation for this condition
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

/// Status subresource shared by ApiCheck, Group and AlertChannel
///
/// Optional fields are serialized as `null` so that a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Identifier of the Checkly resource owned by this object
    #[serde(default)]
    pub external_id: Option<String>,

    /// Generation last pushed to Checkly
    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub phase: SyncPhase,

    /// Hex sha256 of the last applied external representation
    #[serde(default)]
    pub spec_hash: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Reference to a key inside a Secret in the same namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Common surface of the resources driven by the reconcile loop
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;

    fn managed_status(&self) -> Option<&ResourceStatus>;

    fn managed_status_mut(&mut self) -> &mut Option<ResourceStatus>;

    fn external_id(&self) -> Option<&str> {
        self.managed_status()
            .and_then(|s| s.external_id.as_deref())
    }
}
