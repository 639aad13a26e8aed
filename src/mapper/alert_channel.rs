//! AlertChannel → Checkly alert channel

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use super::{Dependencies, Dependency, MapError, ResourceMapper};
use crate::crd::{AlertChannel, SpecValidationError};

const OPSGENIE_REGIONS: [&str; 2] = ["EU", "US"];
const OPSGENIE_PRIORITIES: [&str; 5] = ["P1", "P2", "P3", "P4", "P5"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlertChannelConfigPayload {
    Email {
        address: String,
    },
    Opsgenie {
        name: String,
        #[serde(rename = "apiKey")]
        api_key: String,
        region: String,
        priority: String,
    },
}

/// Body of `POST /v1/alert-channels`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannelPayload {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub config: AlertChannelConfigPayload,
    #[serde(default)]
    pub send_recovery: bool,
    #[serde(default)]
    pub send_failure: bool,
    #[serde(default)]
    pub send_degraded: bool,
    #[serde(default)]
    pub ssl_expiry: bool,
    #[serde(default)]
    pub ssl_expiry_threshold: u32,
}

/// Mapper for AlertChannel resources
#[derive(Clone, Debug, Default)]
pub struct AlertChannelMapper;

fn invalid(field: &str, message: impl Into<String>, how_to_fix: &str) -> MapError {
    MapError::Invalid(SpecValidationError::new(field, message, how_to_fix))
}

impl ResourceMapper for AlertChannelMapper {
    type Resource = AlertChannel;
    type Representation = AlertChannelPayload;

    fn dependencies(&self, channel: &AlertChannel) -> Vec<Dependency> {
        channel
            .spec
            .opsgenie
            .iter()
            .map(|o| Dependency::SecretKey {
                name: o.api_secret.name.clone(),
                key: o.api_secret.key.clone(),
            })
            .collect()
    }

    fn to_external(
        &self,
        channel: &AlertChannel,
        deps: &Dependencies,
    ) -> Result<AlertChannelPayload, MapError> {
        let spec = &channel.spec;

        if spec.ssl_expiry_threshold == 0 || spec.ssl_expiry_threshold > 30 {
            return Err(invalid(
                "spec.sslExpiryThreshold",
                format!("{} is outside 1..=30", spec.ssl_expiry_threshold),
                "set spec.sslExpiryThreshold between 1 and 30 days",
            ));
        }

        let (channel_type, config) = match (&spec.email, &spec.opsgenie) {
            (Some(email), None) => {
                let address = email.address.trim();
                if !address.contains('@') {
                    return Err(invalid(
                        "spec.email.address",
                        format!("'{}' is not an e-mail address", email.address),
                        "set spec.email.address to a valid address",
                    ));
                }
                (
                    "EMAIL",
                    AlertChannelConfigPayload::Email {
                        address: address.to_string(),
                    },
                )
            }
            (None, Some(opsgenie)) => {
                let region = opsgenie.region.trim().to_ascii_uppercase();
                if !OPSGENIE_REGIONS.contains(&region.as_str()) {
                    return Err(invalid(
                        "spec.opsgenie.region",
                        format!("unknown region '{}'", opsgenie.region),
                        "use EU or US",
                    ));
                }
                let priority = opsgenie.priority.trim().to_ascii_uppercase();
                if !OPSGENIE_PRIORITIES.contains(&priority.as_str()) {
                    return Err(invalid(
                        "spec.opsgenie.priority",
                        format!("unknown priority '{}'", opsgenie.priority),
                        "use P1 through P5",
                    ));
                }
                let api_key = deps.require(Dependency::SecretKey {
                    name: opsgenie.api_secret.name.clone(),
                    key: opsgenie.api_secret.key.clone(),
                })?;
                (
                    "OPSGENIE",
                    AlertChannelConfigPayload::Opsgenie {
                        name: channel.name_any(),
                        api_key: api_key.trim().to_string(),
                        region,
                        priority,
                    },
                )
            }
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "spec",
                    "email and opsgenie are mutually exclusive",
                    "configure exactly one channel type",
                ))
            }
            (None, None) => {
                return Err(invalid(
                    "spec",
                    "no channel type configured",
                    "set spec.email or spec.opsgenie",
                ))
            }
        };

        Ok(AlertChannelPayload {
            channel_type: channel_type.to_string(),
            config,
            send_recovery: spec.send_recovery,
            send_failure: spec.send_failure,
            send_degraded: spec.send_degraded,
            ssl_expiry: spec.ssl_expiry,
            ssl_expiry_threshold: spec.ssl_expiry_threshold,
        })
    }
}
