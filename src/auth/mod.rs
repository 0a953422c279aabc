//! Platform linking over OAuth.
//!
//! # Architecture
//!
//! ```text
//! AuthCoordinator ── authenticate_with(key) ──► Launchers ──► DiscordLauncher
//!        ▲                                                      │
//!        │ ChannelEvent (mpsc)                    start_auth    ▼   open browser
//!        └────────────────────────────── SocketChannel ◄── backend (WebSocket)
//!        │
//!        └── publishes AuthLifecycleEvent on the EventBus
//! ```
//!
//! - [`frames`] - Wire DTOs for the auth socket.
//! - [`channel`] - The persistent duplex connection and its receive loop.
//! - [`provider`] - Per-provider launchers and the browser opener.
//! - [`coordinator`] - The `Idle → Started → terminal → Idle` state machine.

pub mod channel;
pub mod coordinator;
pub mod frames;
pub mod provider;

use std::fmt;
use std::str::FromStr;

pub use channel::{ChannelEvent, ConnectionState, SocketChannel, SocketError};
pub use coordinator::{AuthCoordinator, AuthError};
pub use provider::{BrowserOpener, DiscordLauncher, Launchers, ProviderLauncher, SystemBrowser};

/// Supported identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Discord OAuth2.
    Discord,
}

impl Provider {
    /// Every supported provider.
    pub const ALL: [Provider; 1] = [Provider::Discord];

    /// Lowercase wire key.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Provider::Discord => "discord",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Discord => "Discord",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Key that does not name a supported provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Provider::Discord),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// Lifecycle states published for an auth attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Attempt began.
    Started,
    /// Backend confirmed the link.
    Completed,
    /// User cancelled or the connection dropped.
    Cancelled,
    /// Backend reported a failure, or the launch failed.
    Failed,
}

impl AuthState {
    /// Whether this state ends the attempt.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthState::Started)
    }
}

/// Published on the event bus for every auth transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthLifecycleEvent {
    /// Provider the attempt is for.
    pub provider: Provider,
    /// New state.
    pub state: AuthState,
}
