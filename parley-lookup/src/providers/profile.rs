//! Username profiles over HTTP (`GET {base}/profiles/{address}`).

use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    Address, ConfigError, EndpointConfig, LookupError, LookupStatus, ParleyResult,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::http_client;
use crate::backend::{LookupBackend, Resolvable};

const BACKEND: &str = "profile";

/// Who to look up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub address: Address,
}

impl ProfileRequest {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

/// Profile body returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBody {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

/// Resolved profile. `Confirmed` with no username means the address has no
/// profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub address: Address,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub status: LookupStatus,
}

impl Resolvable for Profile {
    fn status(&self) -> LookupStatus {
        self.status
    }
}

/// Looks up profiles from the profile service.
pub struct ProfileLookup {
    client: reqwest::Client,
    base_url: String,
}

impl ProfileLookup {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ParleyResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client: http_client(timeout)?,
            base_url,
        })
    }

    /// Requires `endpoints.profile_base_url`.
    pub fn from_config(config: &EndpointConfig) -> ParleyResult<Self> {
        let base_url = config.profile_base_url.clone().ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "endpoints.profile_base_url".to_string(),
                value: String::new(),
                reason: "required for username lookups".to_string(),
            }
        })?;
        Self::new(base_url, config.request_timeout())
    }

    fn url(&self, address: &Address) -> String {
        format!("{}/profiles/{}", self.base_url, address)
    }
}

impl std::fmt::Debug for ProfileLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileLookup")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl LookupBackend for ProfileLookup {
    type Request = ProfileRequest;
    type Key = Address;
    /// `None` when the service has no profile for the address.
    type Fetched = Option<ProfileBody>;
    type Output = Profile;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn key(&self, request: &ProfileRequest) -> Address {
        request.address.clone()
    }

    async fn lookup(&self, request: &ProfileRequest) -> ParleyResult<Option<ProfileBody>> {
        let response = self
            .client
            .get(self.url(&request.address))
            .send()
            .await
            .map_err(|e| LookupError::RequestFailed {
                backend: BACKEND.to_string(),
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LookupError::RequestFailed {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                message: text,
            }
            .into());
        }

        let body = response.json().await.map_err(|e| LookupError::InvalidResponse {
            backend: BACKEND.to_string(),
            reason: format!("Failed to parse response: {}", e),
        })?;
        Ok(Some(body))
    }

    fn merge(&self, request: &ProfileRequest, fetched: Option<ProfileBody>) -> Profile {
        let body = fetched.unwrap_or_default();
        Profile {
            address: request.address.clone(),
            username: body.username.filter(|name| !name.trim().is_empty()),
            avatar_url: body.avatar_url,
            status: LookupStatus::Confirmed,
        }
    }

    fn synthesize(&self, request: &ProfileRequest, status: LookupStatus) -> Profile {
        Profile {
            address: request.address.clone(),
            username: None,
            avatar_url: None,
            status,
        }
    }
}
