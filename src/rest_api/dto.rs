//! Response bodies of the HTTP endpoints

use serde::{Deserialize, Serialize};

use crate::crd::{Condition, ManagedResource, SyncPhase};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Sync state of one managed resource
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub phase: SyncPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub conditions: Vec<Condition>,
}

impl ResourceSummary {
    pub fn of<K: ManagedResource>(obj: &K) -> Self {
        use kube::ResourceExt;

        let status = obj.managed_status();
        Self {
            kind: K::kind(&()).to_string(),
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            phase: status.map(|s| s.phase).unwrap_or_default(),
            external_id: status.and_then(|s| s.external_id.clone()),
            conditions: status.map(|s| s.conditions.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceListResponse {
    pub items: Vec<ResourceSummary>,
    pub total: usize,
}
