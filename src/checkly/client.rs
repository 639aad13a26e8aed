//! reqwest implementation of [`ChecklyApi`]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ApiError, ChecklyApi};
use crate::crd::ResourceKind;
use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.checklyhq.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API key and account the operator acts as
#[derive(Clone)]
pub struct ChecklyCredentials {
    pub api_key: String,
    pub account_id: String,
}

impl ChecklyCredentials {
    /// Read `CHECKLY_API_KEY` and `CHECKLY_ACCOUNT_ID` from the environment
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("CHECKLY_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            return Err(Error::ConfigError(
                "CHECKLY_API_KEY environment variable is undefined".to_string(),
            ));
        }
        let account_id = std::env::var("CHECKLY_ACCOUNT_ID").unwrap_or_default();
        if account_id.is_empty() {
            return Err(Error::ConfigError(
                "CHECKLY_ACCOUNT_ID environment variable is undefined".to_string(),
            ));
        }
        Ok(Self {
            api_key,
            account_id,
        })
    }
}

impl fmt::Debug for ChecklyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecklyCredentials")
            .field("api_key", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Checkly public API client
#[derive(Clone)]
pub struct ChecklyClient {
    http: Client,
    base_url: String,
    credentials: ChecklyCredentials,
}

impl ChecklyClient {
    pub fn new(base_url: impl Into<String>, credentials: ChecklyCredentials) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("checkly-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn collection_path(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Check => "/v1/checks",
            ResourceKind::Group => "/v1/check-groups",
            ResourceKind::AlertChannel => "/v1/alert-channels",
        }
    }

    /// API checks are written through the typed `/v1/checks/api` endpoint
    fn write_path(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Check => "/v1/checks/api",
            other => Self::collection_path(other),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.credentials.api_key)
            .header("X-Checkly-Account", &self.credentials.account_id)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request.send().await.map_err(|e| ApiError::Transient {
            status: None,
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), body))
    }

    async fn json(response: Response) -> Result<Value, ApiError> {
        response.json().await.map_err(|e| ApiError::Transient {
            status: None,
            message: format!("failed to decode response: {}", e),
        })
    }
}

/// Checkly returns string ids for checks and numeric ids for groups and channels
fn extract_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ChecklyApi for ChecklyClient {
    #[instrument(skip(self, body), fields(kind = %kind))]
    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<String, ApiError> {
        let response = self
            .send(self.request(Method::POST, Self::write_path(kind)).json(body))
            .await?;
        let created = Self::json(response).await?;
        let id = extract_id(&created).ok_or_else(|| ApiError::Transient {
            status: None,
            message: "create response carried no id".to_string(),
        })?;
        debug!("Created Checkly {} {}", kind, id);
        Ok(id)
    }

    #[instrument(skip(self), fields(kind = %kind))]
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, ApiError> {
        let path = format!("{}/{}", Self::collection_path(kind), id);
        let response = self.send(self.request(Method::GET, &path)).await?;
        Self::json(response).await
    }

    #[instrument(skip(self, body), fields(kind = %kind))]
    async fn update(&self, kind: ResourceKind, id: &str, body: &Value) -> Result<(), ApiError> {
        let path = format!("{}/{}", Self::write_path(kind), id);
        self.send(self.request(Method::PUT, &path).json(body))
            .await?;
        debug!("Updated Checkly {} {}", kind, id);
        Ok(())
    }

    #[instrument(skip(self), fields(kind = %kind))]
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}", Self::collection_path(kind), id);
        self.send(self.request(Method::DELETE, &path)).await?;
        debug!("Deleted Checkly {} {}", kind, id);
        Ok(())
    }
}
