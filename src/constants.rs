//! Application-wide constants for bloombell.
//!
//! Magic numbers live here so the tick cadence, timeouts and protocol
//! values are discoverable in one place.
//!
//! # Categories
//!
//! - **Timeouts**: Network and operation timeouts
//! - **Polling**: Host tick cadence
//! - **Roster**: Party size bounds
//! - **Protocol**: Socket frame discriminators and close codes

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for the one-shot `/notify` and `/platforms` calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the WebSocket handshake.
///
/// A connect that never resolves would otherwise leave an auth session
/// stuck in `Started` until the user cancels it.
pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Polling
// ============================================================================

/// Minimum host time between two roster polls.
pub const ROSTER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often the headless `watch` loop calls `RosterTracker::on_frame`.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Roster
// ============================================================================

/// Largest party the game allows, and the upper bound for the threshold.
pub const MAX_PARTY_SIZE: u8 = 8;

/// Smallest configurable threshold.
pub const MIN_PARTY_SIZE: u8 = 1;

/// Expected roster capacity (a full alliance), used to presize snapshots.
pub const ROSTER_CAPACITY: usize = 24;

// ============================================================================
// Protocol
// ============================================================================

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Discord OAuth application id.
pub const DISCORD_CLIENT_ID: &str = "1476010311449448530";

/// Discord OAuth authorize endpoint.
pub const DISCORD_AUTHORIZE_URL: &str = "https://discord.com/api/oauth2/authorize";
