//! Auth lifecycle state machine.
//!
//! ```text
//! Idle ──authenticate_with──► Started ──┬─ authComplete ──► Completed ─┐
//!                                       ├─ authFailed / launch error ─► Failed ──┤
//!                                       ├─ cancel_authentication ──► Cancelled ──┤
//!                                       └─ socket dropped ─────────► Cancelled ──┴─► Idle
//! ```
//!
//! Every transition is published on the [`EventBus`] as an
//! [`AuthLifecycleEvent`]. At most one session is active; a second request
//! while one is in flight is rejected rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::channel::{ChannelEvent, SocketError};
use super::provider::Launchers;
use super::{AuthLifecycleEvent, AuthState, Provider, UnknownProvider};
use crate::context::IdentityProvider;
use crate::events::EventBus;
use crate::platforms::PlatformLinks;

/// Why a coordinator request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No local identity.
    #[error("cannot authenticate: player not fully logged in")]
    NotLoggedIn,
    /// Another session is active.
    #[error("authentication already in progress for {0}")]
    AlreadyInProgress(Provider),
    /// Key does not name a supported provider.
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    /// Nothing to cancel.
    #[error("no authentication in progress")]
    NoActiveSession,
    /// Coordinator has been disposed.
    #[error("auth coordinator has been disposed")]
    Disposed,
}

/// The in-flight attempt. `attempt` distinguishes repeated attempts with
/// the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    attempt: u64,
    provider: Provider,
}

struct CoordinatorInner {
    identity: Arc<dyn IdentityProvider>,
    bus: Arc<EventBus>,
    launchers: Launchers,
    links: Arc<PlatformLinks>,
    session: Mutex<Option<Session>>,
    next_attempt: AtomicU64,
    disposed: AtomicBool,
}

impl CoordinatorInner {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn publish(&self, provider: Provider, state: AuthState) {
        if self.is_disposed() {
            return;
        }
        self.bus.publish(AuthLifecycleEvent { provider, state });
    }

    fn handle_channel_event(&self, event: ChannelEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            ChannelEvent::AuthCompleted { provider, .. } => {
                let Some(provider) = self.resolve_terminal(&provider) else {
                    return;
                };
                log::info!("[Auth] Auth completed for {}", provider);
                self.links.mark_linked(provider);
                self.publish(provider, AuthState::Completed);
            }
            ChannelEvent::AuthFailed { provider, error } => {
                let Some(provider) = self.resolve_terminal(&provider) else {
                    return;
                };
                log::warn!("[Auth] Auth failed for {}: {}", provider, error);
                self.publish(provider, AuthState::Failed);
            }
            ChannelEvent::Disconnected => {
                let Some(Session { provider, .. }) = self.session().take() else {
                    log::debug!("[Auth] Socket disconnected with no active session");
                    return;
                };
                log::warn!(
                    "[Auth] Socket disconnected during auth, treating as cancellation for {}",
                    provider
                );
                self.publish(provider, AuthState::Cancelled);
            }
        }
    }

    /// Clear the session and pick the provider a terminal frame refers to.
    ///
    /// Frames naming an unknown provider fall back to the active session's.
    fn resolve_terminal(&self, key: &str) -> Option<Provider> {
        let active = self.session().take().map(|s| s.provider);
        match key.parse::<Provider>() {
            Ok(provider) => Some(provider),
            Err(e) => {
                if active.is_none() {
                    log::warn!("[Auth] Ignoring terminal frame: {}", e);
                }
                active
            }
        }
    }

    /// End attempt `attempt` as failed, unless it already ended.
    fn launch_failed(&self, attempt: u64, provider: Provider, error: &SocketError) {
        log::error!("[Auth] {} launch failed: {}", provider, error);
        let mut session = self.session();
        if !matches!(*session, Some(s) if s.attempt == attempt) {
            log::debug!("[Auth] Launch failure belongs to a finished attempt; ignoring");
            return;
        }
        *session = None;
        drop(session);
        self.publish(provider, AuthState::Failed);
    }
}

/// Drives auth attempts and republishes their lifecycle.
pub struct AuthCoordinator {
    inner: Arc<CoordinatorInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("active", &self.active_provider())
            .field("disposed", &self.inner.is_disposed())
            .finish_non_exhaustive()
    }
}

impl AuthCoordinator {
    /// Create a coordinator and start listening to `channel_events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        bus: Arc<EventBus>,
        launchers: Launchers,
        links: Arc<PlatformLinks>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            identity,
            bus,
            launchers,
            links,
            session: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        let listener_inner = Arc::clone(&inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = channel_events.recv().await {
                listener_inner.handle_channel_event(event);
            }
            log::debug!("[Auth] Channel event stream closed");
        });

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Begin an auth attempt for the provider named by `key`.
    ///
    /// On success the session is `Started`, the transition is published and
    /// the provider launcher runs in the background exactly once.
    pub fn authenticate_with(&self, key: &str) -> Result<Provider, AuthError> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(AuthError::Disposed);
        }

        let Some(identity) = inner.identity.identity() else {
            log::warn!("[Auth] Cannot authenticate: player not fully logged in");
            return Err(AuthError::NotLoggedIn);
        };

        let (attempt, provider) = {
            let mut session = inner.session();
            if let Some(active) = *session {
                log::warn!(
                    "[Auth] Authentication already in progress for {}",
                    active.provider
                );
                return Err(AuthError::AlreadyInProgress(active.provider));
            }
            let provider = key.parse::<Provider>().map_err(|e| {
                log::warn!("[Auth] {}", e);
                AuthError::from(e)
            })?;
            let attempt = inner.next_attempt.fetch_add(1, Ordering::SeqCst);
            *session = Some(Session { attempt, provider });
            (attempt, provider)
        };

        log::info!("[Auth] Starting authentication for {}", provider);
        inner.publish(provider, AuthState::Started);

        let launcher = inner.launchers.resolve(provider);
        let launch_inner = Arc::clone(inner);
        tokio::spawn(async move {
            if let Err(e) = launcher.authenticate(identity).await {
                launch_inner.launch_failed(attempt, provider, &e);
            }
        });

        Ok(provider)
    }

    /// Cancel the active attempt.
    pub fn cancel_authentication(&self) -> Result<Provider, AuthError> {
        if self.inner.is_disposed() {
            return Err(AuthError::Disposed);
        }
        let provider = self
            .inner
            .session()
            .take()
            .map(|s| s.provider)
            .ok_or(AuthError::NoActiveSession)?;

        log::info!("[Auth] Authentication cancelled for {}", provider);
        self.inner.publish(provider, AuthState::Cancelled);
        Ok(provider)
    }

    /// Provider of the active session, if any.
    pub fn active_provider(&self) -> Option<Provider> {
        self.inner.session().map(|s| s.provider)
    }

    /// Whether a session is active.
    pub fn is_authenticating(&self) -> bool {
        self.active_provider().is_some()
    }

    /// Stop listening to the channel. No transitions are published afterwards.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        log::debug!("[Auth] Coordinator disposed");
    }

    /// Whether [`AuthCoordinator::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for AuthCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::ProviderLauncher;
    use crate::context::SharedIdentity;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLauncher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProviderLauncher for FakeLauncher {
        async fn authenticate(&self, _identity: u64) -> Result<(), SocketError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SocketError::NotConnected)
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        coordinator: AuthCoordinator,
        launcher: Arc<FakeLauncher>,
        identity: Arc<SharedIdentity>,
        links: Arc<PlatformLinks>,
        channel: mpsc::UnboundedSender<ChannelEvent>,
        seen: Arc<Mutex<Vec<AuthLifecycleEvent>>>,
    }

    fn harness_with(launcher: FakeLauncher) -> Harness {
        let launcher = Arc::new(launcher);
        let identity = Arc::new(SharedIdentity::new(4242));
        let bus = Arc::new(EventBus::new());
        let links = Arc::new(PlatformLinks::default());
        let (channel, events) = mpsc::unbounded_channel();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &AuthLifecycleEvent| sink.lock().unwrap().push(*event));

        let coordinator = AuthCoordinator::new(
            Arc::clone(&identity) as Arc<dyn IdentityProvider>,
            bus,
            Launchers::new(Arc::clone(&launcher) as Arc<dyn ProviderLauncher>),
            Arc::clone(&links),
            events,
        );
        Harness {
            coordinator,
            launcher,
            identity,
            links,
            channel,
            seen,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeLauncher::default())
    }

    fn states(h: &Harness) -> Vec<AuthState> {
        h.seen.lock().unwrap().iter().map(|e| e.state).collect()
    }

    async fn wait_for_events(h: &Harness, count: usize) {
        for _ in 0..200 {
            if h.seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_single_flight() {
        let h = harness();

        assert_eq!(h.coordinator.authenticate_with("discord"), Ok(Provider::Discord));
        assert_eq!(
            h.coordinator.authenticate_with("discord"),
            Err(AuthError::AlreadyInProgress(Provider::Discord))
        );
        settle().await;

        assert_eq!(states(&h), vec![AuthState::Started]);
        assert_eq!(h.launcher.calls.load(Ordering::SeqCst), 1);
        assert!(h.coordinator.is_authenticating());
    }

    #[tokio::test]
    async fn test_rejects_when_logged_out() {
        let h = harness();
        h.identity.clear();

        assert_eq!(h.coordinator.authenticate_with("discord"), Err(AuthError::NotLoggedIn));
        settle().await;
        assert!(states(&h).is_empty());
        assert_eq!(h.launcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_unknown_provider() {
        let h = harness();

        assert!(matches!(
            h.coordinator.authenticate_with("myspace"),
            Err(AuthError::UnknownProvider(_))
        ));
        assert!(!h.coordinator.is_authenticating());
        assert!(states(&h).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_started_cancels_once() {
        let h = harness();
        h.coordinator.authenticate_with("discord").unwrap();

        h.channel.send(ChannelEvent::Disconnected).unwrap();
        h.channel.send(ChannelEvent::Disconnected).unwrap();
        wait_for_events(&h, 2).await;
        settle().await;

        assert_eq!(states(&h), vec![AuthState::Started, AuthState::Cancelled]);
        assert!(!h.coordinator.is_authenticating());
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_is_ignored() {
        let h = harness();
        h.channel.send(ChannelEvent::Disconnected).unwrap();
        settle().await;
        assert!(states(&h).is_empty());
    }

    #[tokio::test]
    async fn test_completion_marks_linked() {
        let h = harness();
        h.coordinator.authenticate_with("Discord").unwrap();

        h.channel
            .send(ChannelEvent::AuthCompleted {
                provider: "discord".to_string(),
                user_id: "4242".to_string(),
            })
            .unwrap();
        wait_for_events(&h, 2).await;

        assert_eq!(states(&h), vec![AuthState::Started, AuthState::Completed]);
        assert!(h.links.snapshot().discord);
        assert!(!h.coordinator.is_authenticating());

        // Idle again: a new attempt is accepted.
        assert!(h.coordinator.authenticate_with("discord").is_ok());
    }

    #[tokio::test]
    async fn test_failure_frame_publishes_failed() {
        let h = harness();
        h.coordinator.authenticate_with("discord").unwrap();

        h.channel
            .send(ChannelEvent::AuthFailed {
                provider: "mystery".to_string(),
                error: "denied".to_string(),
            })
            .unwrap();
        wait_for_events(&h, 2).await;

        let seen = h.seen.lock().unwrap().clone();
        assert_eq!(
            seen[1],
            AuthLifecycleEvent {
                provider: Provider::Discord,
                state: AuthState::Failed
            }
        );
        assert!(!h.links.snapshot().discord);
    }

    #[tokio::test]
    async fn test_launch_failure_publishes_failed() {
        let h = harness_with(FakeLauncher {
            fail: true,
            ..FakeLauncher::default()
        });
        h.coordinator.authenticate_with("discord").unwrap();
        wait_for_events(&h, 2).await;

        assert_eq!(states(&h), vec![AuthState::Started, AuthState::Failed]);
        assert!(!h.coordinator.is_authenticating());
    }

    /// First call fails after a delay, later calls succeed.
    #[derive(Default)]
    struct SlowFirstFailure {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderLauncher for SlowFirstFailure {
        async fn authenticate(&self, _identity: u64) -> Result<(), SocketError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(SocketError::NotConnected);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_late_launch_failure_does_not_end_newer_attempt() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &AuthLifecycleEvent| sink.lock().unwrap().push(event.state));

        let (_channel, events) = mpsc::unbounded_channel();
        let launcher = Arc::new(SlowFirstFailure::default());
        let coordinator = AuthCoordinator::new(
            Arc::new(SharedIdentity::new(4242)),
            bus,
            Launchers::new(Arc::clone(&launcher) as Arc<dyn ProviderLauncher>),
            Arc::new(PlatformLinks::default()),
            events,
        );

        coordinator.authenticate_with("discord").unwrap();
        coordinator.cancel_authentication().unwrap();
        coordinator.authenticate_with("discord").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(launcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![AuthState::Started, AuthState::Cancelled, AuthState::Started]
        );
        assert_eq!(coordinator.active_provider(), Some(Provider::Discord));
    }

    #[tokio::test]
    async fn test_cancel() {
        let h = harness();
        assert_eq!(
            h.coordinator.cancel_authentication(),
            Err(AuthError::NoActiveSession)
        );

        h.coordinator.authenticate_with("discord").unwrap();
        assert_eq!(h.coordinator.cancel_authentication(), Ok(Provider::Discord));

        // The socket dropping afterwards is not a second cancellation.
        h.channel.send(ChannelEvent::Disconnected).unwrap();
        settle().await;
        assert_eq!(states(&h), vec![AuthState::Started, AuthState::Cancelled]);
    }

    #[tokio::test]
    async fn test_no_transitions_after_dispose() {
        let h = harness();
        h.coordinator.authenticate_with("discord").unwrap();
        h.coordinator.dispose();

        let _ = h.channel.send(ChannelEvent::Disconnected);
        settle().await;

        assert_eq!(states(&h), vec![AuthState::Started]);
        assert_eq!(
            h.coordinator.authenticate_with("discord"),
            Err(AuthError::Disposed)
        );
        assert!(h.coordinator.is_disposed());
    }
}
