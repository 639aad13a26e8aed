//! Checkly Operator: Kubernetes control plane for checklyhq.com monitoring
//!
//! This crate keeps `ApiCheck`, `Group` and `AlertChannel` custom resources in
//! sync with the Checkly public API, and derives `ApiCheck` resources from
//! annotations placed on Ingress objects.

pub mod annotations;
pub mod checkly;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod mapper;
pub mod store;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, Result};
