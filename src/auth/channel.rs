//! Persistent duplex connection used for the OAuth handshake.
//!
//! [`SocketChannel`] connects lazily on [`SocketChannel::start_auth`], sends a
//! `register` frame and runs a background receive loop for the lifetime of
//! the connection. Inbound frames are turned into [`ChannelEvent`]s on an
//! unbounded mpsc channel handed out by [`SocketChannel::new`].
//!
//! # Loop exits
//!
//! | Exit           | Trigger                              | Event emitted     |
//! |----------------|--------------------------------------|-------------------|
//! | `Resolved`     | `authComplete` / `authFailed` frame  | none (normal close) |
//! | `Disconnected` | close frame, read error, stream end  | `Disconnected`    |
//! | `Cancelled`    | `dispose()` or a failed send         | none              |
//!
//! A resolved attempt closes the socket itself with code 1000 so the far end
//! sees a normal closure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::frames::{InboundFrame, InboundKind, OutboundFrame};
use crate::constants::{CLOSE_NORMAL, SOCKET_CONNECT_TIMEOUT};
use crate::ws::{self, WsFrame, WsReader, WsWriter};

/// Signals delivered to the owner of a [`SocketChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Backend confirmed the account link.
    AuthCompleted {
        /// Provider key as sent by the backend.
        provider: String,
        /// Identity the link belongs to.
        user_id: String,
    },
    /// Backend reported that the OAuth flow failed.
    AuthFailed {
        /// Provider key as sent by the backend.
        provider: String,
        /// Failure description.
        error: String,
    },
    /// Connection ended without a resolved attempt.
    Disconnected,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected; receive loop running.
    Open,
    /// Normal close in progress.
    Closing,
}

/// Errors from channel operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// A send was attempted with no open connection.
    #[error("socket is not connected")]
    NotConnected,
    /// The channel was disposed.
    #[error("socket channel has been disposed")]
    Disposed,
    /// Connecting failed or timed out.
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// Endpoint.
        url: String,
        /// Underlying failure.
        reason: String,
    },
    /// Writing a frame failed.
    #[error("failed to send frame: {0}")]
    SendFailed(String),
    /// Frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The live connection, if any.
#[derive(Debug)]
struct Link {
    writer: Arc<AsyncMutex<WsWriter>>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    state: ConnectionState,
    link: Option<Link>,
    next_generation: u64,
}

#[derive(Debug)]
struct Inner {
    url: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: CancellationToken,
    slot: Mutex<Slot>,
    /// Serializes connect-then-send so two callers never race a handshake.
    connect_lock: AsyncMutex<()>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the link owned by `generation`, unless a newer one replaced it.
    fn release(&self, generation: u64) {
        let mut slot = self.slot();
        if slot.link.as_ref().is_some_and(|link| link.generation == generation) {
            slot.link = None;
            slot.state = ConnectionState::Disconnected;
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.events.send(event);
    }
}

/// Handle to the auth socket. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    inner: Arc<Inner>,
}

impl SocketChannel {
    /// Create a disconnected channel for `url` and the receiver for its events.
    #[must_use]
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            url: url.into(),
            events,
            shutdown: CancellationToken::new(),
            slot: Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                link: None,
                next_generation: 0,
            }),
            connect_lock: AsyncMutex::new(()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Endpoint this channel connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.slot().state
    }

    /// Connect if needed, then register `user_id` for `provider`.
    pub async fn start_auth(&self, user_id: &str, provider: &str) -> Result<(), SocketError> {
        if self.is_disposed() {
            return Err(SocketError::Disposed);
        }
        let _guard = self.inner.connect_lock.lock().await;

        if self.state() != ConnectionState::Open {
            self.connect().await?;
        }

        self.send(&OutboundFrame::register(user_id, provider)).await?;
        log::info!("[SocketChannel] Sent register for {} ({})", user_id, provider);
        Ok(())
    }

    /// Send one frame on the open connection.
    ///
    /// A failed write tears the connection down without a `Disconnected`
    /// event; the error is the caller's signal.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), SocketError> {
        if self.is_disposed() {
            return Err(SocketError::Disposed);
        }
        let text = frame.to_json()?;

        let (writer, cancel) = {
            let slot = self.inner.slot();
            match (&slot.link, slot.state) {
                (Some(link), ConnectionState::Open) => {
                    (Arc::clone(&link.writer), link.cancel.clone())
                }
                _ => return Err(SocketError::NotConnected),
            }
        };

        let result = writer.lock().await.send_text(text).await;
        result.map_err(|e| {
            log::warn!("[SocketChannel] Send failed: {e:#}");
            cancel.cancel();
            SocketError::SendFailed(format!("{e:#}"))
        })
    }

    /// Cancel the receive loop and release the socket.
    ///
    /// No `Disconnected` event follows a disposal. Idempotent.
    pub fn dispose(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        log::debug!("[SocketChannel] Disposing");
        self.inner.shutdown.cancel();
        let mut slot = self.inner.slot();
        slot.link = None;
        slot.state = ConnectionState::Disconnected;
    }

    /// Whether [`SocketChannel::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn connect(&self) -> Result<(), SocketError> {
        let url = self.inner.url.clone();
        self.inner.slot().state = ConnectionState::Connecting;
        log::info!("[SocketChannel] Connecting to {}", url);

        let attempt = tokio::time::timeout(SOCKET_CONNECT_TIMEOUT, ws::connect(&url));
        let result = tokio::select! {
            () = self.inner.shutdown.cancelled() => return Err(SocketError::Disposed),
            result = attempt => result,
        };

        let (writer, reader) = match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(self.connect_failed(url, format!("{e:#}"))),
            Err(_elapsed) => {
                return Err(self.connect_failed(
                    url,
                    format!("timed out after {:?}", SOCKET_CONNECT_TIMEOUT),
                ))
            }
        };

        let writer = Arc::new(AsyncMutex::new(writer));
        let cancel = self.inner.shutdown.child_token();
        let generation = {
            let mut slot = self.inner.slot();
            let generation = slot.next_generation;
            slot.next_generation += 1;
            slot.link = Some(Link {
                writer: Arc::clone(&writer),
                cancel: cancel.clone(),
                generation,
            });
            slot.state = ConnectionState::Open;
            generation
        };
        log::info!("[SocketChannel] Connected");

        tokio::spawn(run_receive_loop(
            Arc::clone(&self.inner),
            reader,
            writer,
            cancel,
            generation,
        ));
        Ok(())
    }

    fn connect_failed(&self, url: String, reason: String) -> SocketError {
        log::warn!("[SocketChannel] Connection to {} failed: {}", url, reason);
        let mut slot = self.inner.slot();
        if slot.link.is_none() {
            slot.state = ConnectionState::Disconnected;
        }
        SocketError::ConnectFailed { url, reason }
    }
}

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionLoopExit {
    /// The attempt completed or failed on the backend.
    Resolved,
    /// Far end closed, read error, or stream end.
    Disconnected,
    /// Cancelled locally.
    Cancelled,
}

async fn run_receive_loop(
    inner: Arc<Inner>,
    mut reader: WsReader,
    writer: Arc<AsyncMutex<WsWriter>>,
    cancel: CancellationToken,
    generation: u64,
) {
    let exit = loop {
        tokio::select! {
            () = cancel.cancelled() => break ConnectionLoopExit::Cancelled,
            frame = reader.recv() => match frame {
                Some(Ok(WsFrame::Text(text))) => match handle_text_message(&text, &inner) {
                    TextMessageResult::Continue => {}
                    TextMessageResult::Resolved => break ConnectionLoopExit::Resolved,
                },
                Some(Ok(WsFrame::Binary(data))) => {
                    log::debug!("[SocketChannel] Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(WsFrame::Control)) => {}
                Some(Ok(WsFrame::Close { code, reason })) => {
                    log::info!("[SocketChannel] Closed by server (code={}, reason={:?})", code, reason);
                    break ConnectionLoopExit::Disconnected;
                }
                Some(Err(e)) => {
                    log::warn!("[SocketChannel] Receive failed: {e:#}");
                    break ConnectionLoopExit::Disconnected;
                }
                None => {
                    log::info!("[SocketChannel] Stream ended");
                    break ConnectionLoopExit::Disconnected;
                }
            },
        }
    };

    if exit == ConnectionLoopExit::Resolved {
        {
            let mut slot = inner.slot();
            if slot.link.as_ref().is_some_and(|link| link.generation == generation) {
                slot.state = ConnectionState::Closing;
            }
        }
        log::info!("[SocketChannel] Closing connection");
        if let Err(e) = writer.lock().await.close_with(CLOSE_NORMAL, "Closing connection").await {
            log::debug!("[SocketChannel] Close handshake failed: {e:#}");
        }
    }

    inner.release(generation);
    log::info!("[SocketChannel] Receive loop ended ({:?})", exit);

    if exit == ConnectionLoopExit::Disconnected && !inner.shutdown.is_cancelled() {
        inner.emit(ChannelEvent::Disconnected);
    }
}

/// Result of processing one text frame.
#[derive(Debug, PartialEq, Eq)]
enum TextMessageResult {
    /// Keep reading.
    Continue,
    /// Attempt resolved; close normally.
    Resolved,
}

fn handle_text_message(text: &str, inner: &Inner) -> TextMessageResult {
    if text.trim().is_empty() {
        return TextMessageResult::Continue;
    }

    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!(
                "[SocketChannel] Failed to parse frame: {} ({})",
                e,
                text.chars().take(100).collect::<String>()
            );
            return TextMessageResult::Continue;
        }
    };

    match frame.classify() {
        InboundKind::AuthComplete => {
            log::info!(
                "[SocketChannel] {} auth complete for user {}",
                frame.provider,
                frame.user_id
            );
            inner.emit(ChannelEvent::AuthCompleted {
                provider: frame.provider,
                user_id: frame.user_id,
            });
            TextMessageResult::Resolved
        }
        InboundKind::AuthFailed => {
            let error = frame.error.unwrap_or_default();
            log::warn!("[SocketChannel] {} auth failed: {}", frame.provider, error);
            inner.emit(ChannelEvent::AuthFailed {
                provider: frame.provider,
                error,
            });
            TextMessageResult::Resolved
        }
        InboundKind::Other => {
            log::debug!("[SocketChannel] Unhandled frame type: {}", frame.kind);
            TextMessageResult::Continue
        }
    }
}
