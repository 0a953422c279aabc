//! Outbound "party is full" notifications.
//!
//! [`NotificationSender`] posts a small JSON payload to the backend's
//! `/notify` endpoint, which fans it out to the user's linked platforms.
//! The call is one-shot: failures are reported to the caller and never
//! retried here.
//!
//! # Payload
//!
//! ```json
//! { "pluginUserId": "4242", "partySize": 8, "maxSize": 8 }
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::constants::HTTP_REQUEST_TIMEOUT;

/// Body of `POST /notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyFullNotification {
    /// Local identity, stringified.
    pub plugin_user_id: String,
    /// Current party size.
    pub party_size: usize,
    /// Configured threshold.
    pub max_size: u8,
}

impl PartyFullNotification {
    /// Build the payload for `identity`.
    #[must_use]
    pub fn new(identity: u64, party_size: usize, max_size: u8) -> Self {
        Self {
            plugin_user_id: identity.to_string(),
            party_size,
            max_size,
        }
    }
}

/// Errors sending a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Request could not be sent or the connection failed.
    #[error("notify request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Server answered with a non-success status.
    #[error("notify rejected: {status} - {body}")]
    Rejected {
        /// HTTP status.
        status: reqwest::StatusCode,
        /// Response body, possibly empty.
        body: String,
    },
}

/// Anything that can deliver a [`PartyFullNotification`].
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    async fn send(&self, notification: &PartyFullNotification) -> Result<(), NotifyError>;
}

/// Sends notifications to the backend over HTTP.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    client: Client,
    notify_url: String,
}

impl NotificationSender {
    /// Creates a sender posting to `notify_url` (the full `/notify` URL).
    pub fn new(client: Client, notify_url: impl Into<String>) -> Self {
        Self {
            client,
            notify_url: notify_url.into(),
        }
    }

    /// Creates a sender with its own client using the default timeout.
    pub fn with_default_client(notify_url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;
        Ok(Self::new(client, notify_url))
    }
}

#[async_trait]
impl NotificationSink for NotificationSender {
    async fn send(&self, notification: &PartyFullNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.notify_url)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            log::info!(
                "[Notifier] Sent party-full notification: user={}, size={}/{}",
                notification.plugin_user_id,
                notification.party_size,
                notification.max_size
            );
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Rejected { status, body })
        }
    }
}
