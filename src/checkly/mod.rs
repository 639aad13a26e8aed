//! Boundary to the Checkly public API
//!
//! The reconcile loop only talks to Checkly through [`ChecklyApi`]. Transport,
//! authentication and retries of individual HTTP requests belong to the
//! implementation; the loop decides what to do from the [`ApiError`] class.

mod client;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::crd::ResourceKind;

pub use client::{ChecklyClient, ChecklyCredentials, DEFAULT_API_URL};

/// Classified failure of a Checkly API call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The resource does not exist (404)
    #[error("resource not found")]
    NotFound,

    /// Concurrent modification on the Checkly side (409/412)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network failure, timeout, rate limit or 5xx
    #[error("transient failure (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Checkly refused the request (4xx other than 404/409)
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl ApiError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => ApiError::NotFound,
            409 | 412 => ApiError::Conflict(message),
            408 | 429 | 500..=599 => ApiError::Transient {
                status: Some(status),
                message,
            },
            _ => ApiError::Rejected { status, message },
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, ApiError::Transient { .. } | ApiError::Conflict(_))
    }

    /// Condition reason for this error class
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::NotFound => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Transient { .. } => "Transient",
            ApiError::Rejected { .. } => "Rejected",
        }
    }
}

/// CRUD by external id against the Checkly API
///
/// Representations are JSON documents produced by a `ResourceMapper`.
/// Every call must be safe to repeat.
#[async_trait]
pub trait ChecklyApi: Send + Sync {
    /// Create a resource and return its external id
    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<String, ApiError>;

    /// Fetch the current representation; `ApiError::NotFound` when absent
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, ApiError>;

    /// Replace the whole resource
    async fn update(&self, kind: ResourceKind, id: &str, body: &Value) -> Result<(), ApiError>;

    /// Delete the resource; `ApiError::NotFound` when already gone
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ApiError>;
}
