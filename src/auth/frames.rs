//! Auth socket wire format.
//!
//! Outbound: `{"type":"register","userId":"..","provider":".."}`.
//! Inbound: `{"type":"authComplete"|"authFailed"|..,"provider":"..","userId":"..","error":".."}`.

use serde::{Deserialize, Serialize};

/// Frame sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    /// Ask the backend to route the OAuth callback for `user_id` to this socket.
    #[serde(rename = "register")]
    Register {
        /// Local identity, stringified.
        #[serde(rename = "userId")]
        user_id: String,
        /// Provider key.
        provider: String,
    },
}

impl OutboundFrame {
    /// Registration frame.
    #[must_use]
    pub fn register(user_id: &str, provider: &str) -> Self {
        Self::Register {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        }
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frame received from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    /// Discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider key.
    #[serde(default)]
    pub provider: String,
    /// Identity the frame is about.
    #[serde(default, rename = "userId")]
    pub user_id: String,
    /// Failure description for `authFailed`.
    #[serde(default)]
    pub error: Option<String>,
}

/// What an inbound frame means to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// OAuth finished and the account is linked.
    AuthComplete,
    /// OAuth failed on the backend.
    AuthFailed,
    /// Anything else; ignored.
    Other,
}

impl InboundFrame {
    /// Parse JSON text.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Classify by discriminator.
    #[must_use]
    pub fn classify(&self) -> InboundKind {
        match self.kind.as_str() {
            "authComplete" => InboundKind::AuthComplete,
            "authFailed" => InboundKind::AuthFailed,
            _ => InboundKind::Other,
        }
    }
}
