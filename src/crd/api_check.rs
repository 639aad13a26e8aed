//! ApiCheck Custom Resource Definition
//!
//! An ApiCheck is mirrored 1:1 to a Checkly API check. ApiChecks are either
//! authored directly or derived from Ingress annotations, in which case they
//! carry owner labels pointing back at the Ingress rule that produced them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ManagedResource, ResourceKind, ResourceStatus};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.checklyhq.com",
    version = "v1alpha1",
    kind = "ApiCheck",
    namespaced,
    status = "ResourceStatus",
    shortname = "apicheck",
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApiCheckSpec {
    /// Absolute http(s) URL probed by the check
    pub endpoint: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Expected HTTP status code
    #[serde(default = "default_success")]
    pub success: String,

    /// Check interval, e.g. "30s", "5m", "1h" or bare minutes
    #[serde(default = "default_frequency")]
    pub frequency: String,

    /// Maximum response time in milliseconds before the check fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_time: Option<u32>,

    #[serde(default)]
    pub muted: bool,

    #[serde(default = "default_true")]
    pub activated: bool,

    /// Name of a Group in the same namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default)]
    pub locations: Vec<String>,

    /// Extra assertions evaluated after the status code assertion
    #[serde(default)]
    pub assertions: Vec<Assertion>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Assertion on the check response
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    /// STATUS_CODE, TEXT_BODY, JSON_BODY, HEADERS or RESPONSE_TIME
    pub source: String,
    /// EQUALS, NOT_EQUALS, CONTAINS, NOT_CONTAINS, LESS_THAN, GREATER_THAN, ...
    pub comparison: String,
    #[serde(default)]
    pub property: String,
    pub target: String,
}

pub(crate) fn default_method() -> String {
    "GET".to_string()
}

pub(crate) fn default_success() -> String {
    "200".to_string()
}

pub(crate) fn default_frequency() -> String {
    "5m".to_string()
}

fn default_true() -> bool {
    true
}

impl ApiCheckSpec {
    /// Spec with defaults for everything but the endpoint
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: default_method(),
            success: default_success(),
            frequency: default_frequency(),
            max_response_time: None,
            muted: false,
            activated: true,
            group: None,
            locations: Vec::new(),
            assertions: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl ManagedResource for ApiCheck {
    const KIND: ResourceKind = ResourceKind::Check;

    fn managed_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn managed_status_mut(&mut self) -> &mut Option<ResourceStatus> {
        &mut self.status
    }
}
