//! Group → Checkly check group

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use super::{canonical_list, numeric_id, Dependencies, Dependency, MapError, ResourceMapper};
use crate::crd::{Group, SpecValidationError};

const MAX_CONCURRENCY: u32 = 10;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertChannelSubscription {
    pub alert_channel_id: i64,
    pub activated: bool,
}

/// Body of `POST /v1/check-groups`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupPayload {
    pub name: String,
    pub activated: bool,
    pub muted: bool,
    pub concurrency: u32,
    pub locations: Vec<String>,
    pub tags: Vec<String>,
    pub alert_channel_subscriptions: Vec<AlertChannelSubscription>,
    pub use_global_alert_settings: bool,
}

/// Mapper for Group resources
#[derive(Clone, Debug)]
pub struct GroupMapper {
    default_locations: Vec<String>,
}

impl GroupMapper {
    pub fn new(default_locations: Vec<String>) -> Self {
        Self {
            default_locations: canonical_list(&default_locations),
        }
    }
}

impl ResourceMapper for GroupMapper {
    type Resource = Group;
    type Representation = GroupPayload;

    fn dependencies(&self, group: &Group) -> Vec<Dependency> {
        canonical_list(&group.spec.alert_channels)
            .into_iter()
            .map(Dependency::AlertChannel)
            .collect()
    }

    fn to_external(&self, group: &Group, deps: &Dependencies) -> Result<GroupPayload, MapError> {
        let spec = &group.spec;

        if spec.concurrency == 0 || spec.concurrency > MAX_CONCURRENCY {
            return Err(MapError::Invalid(SpecValidationError::new(
                "spec.concurrency",
                format!("{} is outside 1..={}", spec.concurrency, MAX_CONCURRENCY),
                "set spec.concurrency between 1 and 10",
            )));
        }

        let mut subscriptions = Vec::new();
        for channel in canonical_list(&spec.alert_channels) {
            let id = deps.require(Dependency::AlertChannel(channel.clone()))?;
            subscriptions.push(AlertChannelSubscription {
                alert_channel_id: numeric_id("spec.alertChannels", id)?,
                activated: true,
            });
        }
        subscriptions.sort_by_key(|s| s.alert_channel_id);

        let mut locations = canonical_list(&spec.locations);
        if locations.is_empty() {
            locations = self.default_locations.clone();
        }

        Ok(GroupPayload {
            name: group.name_any(),
            activated: spec.activated,
            muted: spec.muted,
            concurrency: spec.concurrency,
            locations,
            tags: canonical_list(&spec.tags),
            use_global_alert_settings: subscriptions.is_empty(),
            alert_channel_subscriptions: subscriptions,
        })
    }

    fn normalize(&self, mut payload: GroupPayload) -> GroupPayload {
        payload.locations = canonical_list(&payload.locations);
        payload.tags = canonical_list(&payload.tags);
        payload
            .alert_channel_subscriptions
            .sort_by_key(|s| s.alert_channel_id);
        payload
    }
}
