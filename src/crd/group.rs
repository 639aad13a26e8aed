//! Group Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ManagedResource, ResourceKind, ResourceStatus};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.checklyhq.com",
    version = "v1alpha1",
    kind = "Group",
    namespaced,
    status = "ResourceStatus",
    shortname = "checkgroup",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    #[serde(default)]
    pub locations: Vec<String>,

    /// Names of AlertChannel resources in the same namespace
    #[serde(default)]
    pub alert_channels: Vec<String>,

    #[serde(default)]
    pub muted: bool,

    #[serde(default = "default_true")]
    pub activated: bool,

    /// Number of checks run in parallel when the group is triggered
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> u32 {
    2
}

impl ManagedResource for Group {
    const KIND: ResourceKind = ResourceKind::Group;

    fn managed_status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn managed_status_mut(&mut self) -> &mut Option<ResourceStatus> {
        &mut self.status
    }
}
