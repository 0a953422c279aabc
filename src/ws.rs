//! WebSocket transport for the auth handshake.
//!
//! Thin wrapper around `tokio-tungstenite` that splits a connection into a
//! [`WsWriter`] and a [`WsReader`], so the receive loop can own the read half
//! while the caller keeps sending on the write half.
//!
//! Control frames are surfaced as [`WsFrame`] variants; pings are answered by
//! tungstenite itself when the next write or read is polled.

use std::borrow::Cow;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// A frame read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping or pong control frame.
    Control,
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a close frame with the given code and reason, then flush.
    pub async fn close_with(&mut self, code: u16, reason: &'static str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next frame, returning `None` when the stream ends.
    pub async fn recv(&mut self) -> Option<Result<WsFrame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => WsFrame::Text(text),
                Ok(tungstenite::Message::Binary(data)) => WsFrame::Binary(data),
                Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)) => {
                    WsFrame::Control
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map_or((1005, String::new()), |cf| {
                            (cf.code.into(), cf.reason.into_owned())
                        });
                    WsFrame::Close { code, reason }
                }
                // Raw frames only appear when writing; skip them.
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(frame));
        }
    }
}

/// Connect to a WebSocket URL and split the stream.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
