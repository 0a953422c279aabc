//! Linked-platform status.
//!
//! The backend is authoritative about which notification platforms an
//! identity has linked. [`PlatformService::refresh`] asks it via
//! `GET /platforms?userId=<id>` and mirrors the answer into the shared
//! [`PlatformLinks`] store; the auth coordinator also marks a provider linked
//! locally as soon as a link completes.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::auth::Provider;
use crate::constants::HTTP_REQUEST_TIMEOUT;

/// Per-provider linked flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStatus {
    /// Discord linked.
    pub discord: bool,
}

impl PlatformStatus {
    /// Whether `provider` is linked.
    #[must_use]
    pub fn is_linked(&self, provider: Provider) -> bool {
        match provider {
            Provider::Discord => self.discord,
        }
    }

    /// Set the flag for `provider`.
    pub fn set_linked(&mut self, provider: Provider, linked: bool) {
        match provider {
            Provider::Discord => self.discord = linked,
        }
    }
}

/// `GET /platforms` response body.
#[derive(Debug, Default, Deserialize)]
struct PlatformsResponse {
    #[serde(default)]
    platforms: PlatformFlags,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformFlags {
    #[serde(default)]
    discord: bool,
}

impl From<PlatformsResponse> for PlatformStatus {
    fn from(response: PlatformsResponse) -> Self {
        Self {
            discord: response.platforms.discord,
        }
    }
}

/// Errors fetching platform status.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Request could not be sent.
    #[error("platform status request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success status.
    #[error("platform status request returned {0}")]
    Status(reqwest::StatusCode),
    /// Body was not the expected JSON.
    #[error("failed to parse platform status: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Source of authoritative platform status.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch status for `identity`.
    async fn status(&self, identity: u64) -> Result<PlatformStatus, PlatformError>;
}

/// Fetches status from the backend over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPlatformClient {
    client: Client,
    platforms_url: String,
}

impl HttpPlatformClient {
    /// Client querying `platforms_url` (the full `/platforms` URL).
    pub fn new(client: Client, platforms_url: impl Into<String>) -> Self {
        Self {
            client,
            platforms_url: platforms_url.into(),
        }
    }

    /// Client with its own reqwest client using the default timeout.
    pub fn with_default_client(platforms_url: impl Into<String>) -> Result<Self, PlatformError> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;
        Ok(Self::new(client, platforms_url))
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn status(&self, identity: u64) -> Result<PlatformStatus, PlatformError> {
        let response = self
            .client
            .get(&self.platforms_url)
            .query(&[("userId", identity.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::Status(status));
        }

        let body = response.text().await?;
        let parsed: PlatformsResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }
}

/// Shared linked-state store.
#[derive(Debug, Default)]
pub struct PlatformLinks {
    status: Mutex<PlatformStatus>,
}

impl PlatformLinks {
    /// Store seeded with `status`.
    #[must_use]
    pub fn new(status: PlatformStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    /// Current flags.
    pub fn snapshot(&self) -> PlatformStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all flags.
    pub fn replace(&self, status: PlatformStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Mark `provider` linked.
    pub fn mark_linked(&self, provider: Provider) {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_linked(provider, true);
    }
}

/// Refreshes [`PlatformLinks`] from a [`PlatformClient`].
#[derive(Clone)]
pub struct PlatformService {
    client: Arc<dyn PlatformClient>,
    links: Arc<PlatformLinks>,
}

impl std::fmt::Debug for PlatformService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformService")
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

impl PlatformService {
    /// Service writing into `links`.
    pub fn new(client: Arc<dyn PlatformClient>, links: Arc<PlatformLinks>) -> Self {
        Self { client, links }
    }

    /// Shared store this service updates.
    pub fn links(&self) -> &Arc<PlatformLinks> {
        &self.links
    }

    /// Fetch and store the current status.
    ///
    /// Any failure is logged and yields (and stores) all-unlinked.
    pub async fn refresh(&self, identity: u64) -> PlatformStatus {
        let status = match self.client.status(identity).await {
            Ok(status) => status,
            Err(e) => {
                log::warn!("[Platforms] Failed to fetch connected platforms: {e}");
                PlatformStatus::default()
            }
        };
        self.links.replace(status);
        status
    }
}
