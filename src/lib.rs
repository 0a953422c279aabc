//! BloomBell - party roster watcher with platform notifications.
//!
//! Watches a bounded party roster, reports joins and leaves, and pings the
//! user's linked platforms once each time the party fills up. Platforms are
//! linked through an OAuth flow whose completion is pushed back over a
//! WebSocket.
//!
//! # Architecture
//!
//! - **RosterTracker** - Polls the roster once a second, diffs two snapshots
//! - **ThresholdNotifier** - Edge-triggered "party is full" notification
//! - **SocketChannel** - Duplex connection carrying the auth handshake
//! - **AuthCoordinator** - Auth lifecycle state machine
//! - **EventBus** - Type-keyed pub/sub for lifecycle events
//!
//! # Modules
//!
//! - [`roster`] - Roster model, sources and tracker
//! - [`notifier`] - Threshold notifier
//! - [`auth`] - Providers, socket channel and coordinator
//! - [`events`] - Event bus
//! - [`config`] - Configuration loading/saving

pub mod auth;
pub mod events;
pub mod monitor;
pub mod notifier;
pub mod roster;
pub mod ws;

pub mod config;
pub mod constants;
pub mod context;
pub mod notifications;
pub mod platforms;

// Re-export commonly used types
pub use auth::{AuthCoordinator, AuthLifecycleEvent, AuthState, Provider, SocketChannel};
pub use config::Config;
pub use context::Services;
pub use events::EventBus;
pub use monitor::Monitor;
pub use notifier::{NotifierSettings, NotifyDecision, ThresholdNotifier};
pub use roster::{MemberInfo, MembershipChange, RosterTracker};
