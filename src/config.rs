//! Configuration loading and persistence.
//!
//! Settings live in `config.json` inside the config directory and can be
//! overridden per process with `BLOOMBELL_*` environment variables. The core
//! components only ever see snapshots derived from a [`Config`]; loading and
//! saving is the binary's job.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::constants::{MAX_PARTY_SIZE, MIN_PARTY_SIZE};
use crate::notifier::{NotifierSettings, Threshold};
use crate::platforms::PlatformStatus;
use crate::ws::http_to_ws_scheme;

const CONFIG_FILE: &str = "config.json";

/// Configuration for bloombell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the backend (HTTP endpoints and OAuth callback).
    pub server_url: String,
    /// WebSocket endpoint used for the auth handshake.
    pub socket_url: String,
    /// Party size that triggers a notification (1..=8).
    pub max_party_size: u8,
    /// Suppress outbound notifications.
    pub pause_notifications: bool,
    /// Notify even while the app has focus.
    pub notify_when_focused: bool,
    /// Last known Discord link state.
    pub discord_linked: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://bloombell.maot.dev".to_string(),
            socket_url: "wss://bloombell.maot.dev".to_string(),
            max_party_size: MAX_PARTY_SIZE,
            pause_notifications: false,
            notify_when_focused: false,
            discord_linked: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `BLOOMBELL_CONFIG_DIR` wins over the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("BLOOMBELL_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("bloombell")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config dir, with environment overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`, falling back to defaults.
    pub fn load_from(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        let mut config = match Self::read_file(&path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring unreadable config {}: {e:#}", path.display());
                Self::default()
            }
        };
        config.normalize();
        config
    }

    fn read_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `BLOOMBELL_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("BLOOMBELL_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(socket_url) = lookup("BLOOMBELL_SOCKET_URL") {
            self.socket_url = socket_url;
        }

        if let Some(size) = lookup("BLOOMBELL_MAX_PARTY_SIZE") {
            if let Ok(size) = size.trim().parse::<i64>() {
                self.max_party_size = Threshold::clamped(size).get();
            }
        }

        if let Some(pause) = lookup("BLOOMBELL_PAUSE_NOTIFICATIONS").and_then(|v| parse_flag(&v)) {
            self.pause_notifications = pause;
        }

        if let Some(focused) = lookup("BLOOMBELL_NOTIFY_WHEN_FOCUSED").and_then(|v| parse_flag(&v)) {
            self.notify_when_focused = focused;
        }

        self.normalize();
    }

    fn normalize(&mut self) {
        self.max_party_size = self.max_party_size.clamp(MIN_PARTY_SIZE, MAX_PARTY_SIZE);
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        self.socket_url = http_to_ws_scheme(&self.socket_url);
    }

    /// Persists the configuration to the config dir.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// `POST` target for party-full notifications.
    pub fn notify_url(&self) -> String {
        format!("{}/notify", self.server_url)
    }

    /// `GET` target for linked-platform status.
    pub fn platforms_url(&self) -> String {
        format!("{}/platforms", self.server_url)
    }

    /// Backend login page.
    pub fn login_url(&self) -> String {
        format!("{}/login", self.server_url)
    }

    /// OAuth redirect target.
    pub fn callback_url(&self) -> String {
        format!("{}/callback", self.server_url)
    }

    /// Notifier settings snapshot.
    pub fn notifier_settings(&self) -> NotifierSettings {
        NotifierSettings {
            threshold: Threshold::clamped(i64::from(self.max_party_size)),
            pause: self.pause_notifications,
            notify_when_focused: self.notify_when_focused,
        }
    }

    /// Locally known platform links.
    pub fn platform_status(&self) -> PlatformStatus {
        PlatformStatus {
            discord: self.discord_linked,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
