//! Provider launchers.
//!
//! A launcher starts the provider-specific half of an auth attempt: it
//! registers the identity on the [`SocketChannel`] and then sends the user to
//! the provider's consent page. The browser step is best effort; if it fails
//! the URL is logged so the user can open it by hand, and the attempt stays
//! live until the socket resolves or drops.

use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;

use super::channel::{SocketChannel, SocketError};
use super::Provider;
use crate::constants::{DISCORD_AUTHORIZE_URL, DISCORD_CLIENT_ID};

/// Opens a URL for the user.
pub trait BrowserOpener: Send + Sync {
    /// Open `url`.
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default handler.
///
/// With `BLOOMBELL_NO_BROWSER` set, only logs the URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        if std::env::var_os("BLOOMBELL_NO_BROWSER").is_some() {
            log::info!("[Auth] Open this URL to continue: {}", url);
            return Ok(());
        }

        #[cfg(target_os = "macos")]
        let mut command = {
            let mut command = Command::new("open");
            command.arg(url);
            command
        };

        #[cfg(target_os = "windows")]
        let mut command = {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", "", url]);
            command
        };

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let mut command = {
            let mut command = Command::new("xdg-open");
            command.arg(url);
            command
        };

        command.spawn().context("Failed to open browser")?;
        Ok(())
    }
}

/// Starts the provider side of an auth attempt.
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    /// Register `identity` and open the consent flow.
    async fn authenticate(&self, identity: u64) -> Result<(), SocketError>;
}

/// Discord OAuth2 launcher.
pub struct DiscordLauncher {
    channel: SocketChannel,
    callback_url: String,
    browser: Arc<dyn BrowserOpener>,
}

impl std::fmt::Debug for DiscordLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordLauncher")
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

impl DiscordLauncher {
    /// Launcher redirecting to `callback_url` after consent.
    pub fn new(
        channel: SocketChannel,
        callback_url: impl Into<String>,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self {
            channel,
            callback_url: callback_url.into(),
            browser,
        }
    }

    /// Consent page URL for `identity`.
    pub fn authorize_url(&self, identity: u64) -> Result<Url> {
        let state = identity.to_string();
        Url::parse_with_params(
            DISCORD_AUTHORIZE_URL,
            [
                ("client_id", DISCORD_CLIENT_ID),
                ("response_type", "code"),
                ("redirect_uri", self.callback_url.as_str()),
                ("scope", "identify"),
                ("state", state.as_str()),
            ],
        )
        .context("Failed to build Discord authorize URL")
    }
}

#[async_trait]
impl ProviderLauncher for DiscordLauncher {
    async fn authenticate(&self, identity: u64) -> Result<(), SocketError> {
        let provider = Provider::Discord;
        log::info!("[Auth] Starting socket registration for {} ({})", identity, provider);

        self.channel
            .start_auth(&identity.to_string(), provider.key())
            .await?;

        log::info!("[Auth] Socket registered, opening {} consent page", provider.display_name());
        match self.authorize_url(identity) {
            Ok(url) => {
                if let Err(e) = self.browser.open(url.as_str()) {
                    log::warn!("[Auth] {e:#}; open this URL manually: {}", url);
                }
            }
            Err(e) => log::error!("[Auth] {e:#}"),
        }
        Ok(())
    }
}

/// One launcher per supported provider.
#[derive(Clone)]
pub struct Launchers {
    discord: Arc<dyn ProviderLauncher>,
}

impl std::fmt::Debug for Launchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launchers").finish_non_exhaustive()
    }
}

impl Launchers {
    /// Launcher set from explicit implementations.
    pub fn new(discord: Arc<dyn ProviderLauncher>) -> Self {
        Self { discord }
    }

    /// Real launchers sharing `channel`.
    pub fn standard(
        channel: &SocketChannel,
        callback_url: &str,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self::new(Arc::new(DiscordLauncher::new(
            channel.clone(),
            callback_url,
            browser,
        )))
    }

    /// Launcher for `provider`.
    pub fn resolve(&self, provider: Provider) -> Arc<dyn ProviderLauncher> {
        match provider {
            Provider::Discord => Arc::clone(&self.discord),
        }
    }
}
