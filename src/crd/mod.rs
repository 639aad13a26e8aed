//! Custom Resource Definitions for the Checkly operator
//!
//! This module defines the Kubernetes CRDs mirrored into Checkly.

mod alert_channel;
mod api_check;
mod group;
pub mod types;


pub use alert_channel::{AlertChannel, AlertChannelSpec, EmailConfig, OpsgenieConfig};
pub use api_check::{ApiCheck, ApiCheckSpec, Assertion};
pub use group::{Group, GroupSpec};
pub use types::*;

/// All CRDs served by the operator, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    use kube::CustomResourceExt;
    vec![AlertChannel::crd(), Group::crd(), ApiCheck::crd()]
}
