//! AlertChannel Custom Resource Definition
//!
//! Supports e-mail and Opsgenie channels. The Opsgenie API key is never stored
//! in the resource itself; it is read from a Secret at reconcile time.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ManagedResource, ResourceKind, ResourceStatus, SecretKeyRef};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.checklyhq.com",
    version = "v1alpha1",
    kind = "AlertChannel",
    namespaced,
    status = "ResourceStatus",
    shortname = "alertchannel",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannelSpec {
    #[serde(default = "default_true")]
    pub send_recovery: bool,

    #[serde(default = "default_true")]
    pub send_failure: bool,

    #[serde(default)]
    pub send_degraded: bool,

    /// Alert when the endpoint certificate is about to expire
    #[serde(default)]
    pub ssl_expiry: bool,

    /// Days before expiry at which to alert
    #[serde(default = "default_ssl_expiry_threshold")]
    pub ssl_expiry_threshold: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opsgenie: Option<OpsgenieConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub address: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpsgenieConfig {
    /// Secret key holding the Opsgenie API key
    pub api_secret: SecretKeyRef,
    /// EU or US
    #[serde(default = "default_region")]
    pub region: String,
    /// P1 (critical) to P5 (informational)
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_true() -> bool {
    true
}

fn default_ssl_expiry_threshold() -> u32 {
    30
}

fn default_region() -> String {
    "EU".to_string()
}

fn default_priority() -> String {
    "P3".to_string()
}

impl ManagedResource for AlertChannel {
    const KIND: ResourceKind = ResourceKind::AlertChannel;

    fn managed_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn managed_status_mut(&mut self) -> &mut Option<ResourceStatus> {
        &mut self.status
    }
}
