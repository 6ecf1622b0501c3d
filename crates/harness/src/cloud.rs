//! Control-plane verification client.
//!
//! A thin request wrapper around the control plane's query API, used by
//! scenarios to assert on actually-provisioned state. Responses are never
//! cached: verification must always reflect live state. A missing stack is
//! a valid, sometimes-expected outcome ([`CloudError::NotFound`]), e.g. when
//! verifying that a rejected deploy created nothing.

use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Maximum length for error body in error messages.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Request timeout for a single verification call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Regex pattern for Bearer tokens in text.
static BEARER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/-]+=*").ok());

/// Sanitize an error response body before embedding it in an error message:
/// strips Bearer tokens the control plane may have echoed back and truncates
/// long bodies.
fn sanitize_error_body(body: &str) -> String {
    let sanitized = match BEARER_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(body, "[BEARER_REDACTED]").into_owned(),
        None => body.to_string(),
    };

    if sanitized.len() > MAX_ERROR_BODY_LEN {
        let truncated: String = sanitized.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}...[truncated]", truncated)
    } else {
        sanitized
    }
}

/// Control-plane client errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The queried stack does not exist. Expected by negative scenarios.
    #[error("stack `{name}` does not exist")]
    NotFound { name: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Live description of one deployed stack.
#[derive(Debug, Clone, Deserialize)]
pub struct StackDescription {
    /// Globally-unique stack identifier (`srn:`-prefixed).
    pub stack_id: String,

    /// Full (prefixed) stack name.
    pub stack_name: String,

    /// Lifecycle status, e.g. `CREATE_COMPLETE`.
    pub status: String,
}

/// One provisioned resource inside a stack.
#[derive(Debug, Clone, Deserialize)]
pub struct StackResource {
    /// Logical id from the synthesized template.
    pub logical_id: String,

    /// Resource type, e.g. `Strata::Messaging::Topic`.
    pub resource_type: String,

    /// Backend-assigned physical id, once provisioning completed.
    #[serde(default)]
    pub physical_id: Option<String>,

    /// Provisioning status of this resource.
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ListStacksResponse {
    stacks: Vec<StackDescription>,
}

#[derive(Debug, Deserialize)]
struct ListResourcesResponse {
    resources: Vec<StackResource>,
}

/// Client for the control plane's query API.
pub struct ControlPlaneClient {
    base_url: String,
    api_token: Option<String>,
    http_client: Client,
}

impl ControlPlaneClient {
    /// Create a new client against `base_url`.
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self, CloudError> {
        let http_client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            base_url: base_url.into(),
            api_token,
            http_client,
        })
    }

    /// The configured endpoint.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Describe one stack by its full name or `srn:` identifier.
    pub async fn describe_stack(&self, name: &str) -> Result<StackDescription, CloudError> {
        let url = format!("{}/v1/stacks/{}", self.base_url, name);
        let response = self.get(&url).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound {
                name: name.to_string(),
            });
        }
        let response = Self::check_status(response).await?;

        Ok(response.json().await?)
    }

    /// List stacks whose full name starts with `prefix`.
    pub async fn list_stacks(&self, prefix: &str) -> Result<Vec<StackDescription>, CloudError> {
        let url = format!("{}/v1/stacks?prefix={}", self.base_url, prefix);
        let response = Self::check_status(self.get(&url).await?).await?;

        let listing: ListStacksResponse = response.json().await?;
        Ok(listing.stacks)
    }

    /// List the provisioned resources of one stack.
    pub async fn list_stack_resources(&self, name: &str) -> Result<Vec<StackResource>, CloudError> {
        let url = format!("{}/v1/stacks/{}/resources", self.base_url, name);
        let response = self.get(&url).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound {
                name: name.to_string(),
            });
        }
        let response = Self::check_status(response).await?;

        let listing: ListResourcesResponse = response.json().await?;
        Ok(listing.resources)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, CloudError> {
        let mut request = self.http_client.get(url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::RequestFailed {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }
        Ok(response)
    }
}
