//! Integration tests for the auth socket and coordinator.
//!
//! Each test runs a one-connection WebSocket server on 127.0.0.1 that plays
//! the backend's side of the handshake.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bloombell::auth::{
    AuthCoordinator, AuthLifecycleEvent, AuthState, BrowserOpener, ChannelEvent, ConnectionState,
    Launchers, Provider, SocketChannel,
};
use bloombell::context::{IdentityProvider, SharedIdentity};
use bloombell::events::EventBus;
use bloombell::platforms::PlatformLinks;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one connection and run `script` on it.
async fn spawn_server<F, Fut, T>(script: F) -> (String, JoinHandle<T>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        script(ws).await
    });
    (format!("ws://{addr}"), handle)
}

async fn read_register(ws: &mut ServerSocket) -> serde_json::Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected register frame, got {other:?}"),
        }
    }
}

/// Wait for the client's close frame and return its code.
async fn await_close(ws: &mut ServerSocket) -> Option<CloseCode> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Close(frame) = message {
            return frame.map(|f| f.code);
        }
    }
    None
}

async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn expect_no_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "unexpected channel event"
    );
}

async fn wait_for_state(channel: &SocketChannel, state: ConnectionState) {
    for _ in 0..100 {
        if channel.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel never reached {state:?}, stuck at {:?}", channel.state());
}

#[tokio::test]
async fn test_register_then_complete_closes_normally() {
    let (url, server) = spawn_server(|mut ws| async move {
        let register = read_register(&mut ws).await;
        send_json(
            &mut ws,
            serde_json::json!({ "type": "authComplete", "provider": "discord", "userId": "4242" }),
        )
        .await;
        let close = await_close(&mut ws).await;
        (register, close)
    })
    .await;

    let (channel, mut events) = SocketChannel::new(url);
    channel.start_auth("4242", "discord").await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Open);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ChannelEvent::AuthCompleted {
            provider: "discord".to_string(),
            user_id: "4242".to_string()
        }
    );

    let (register, close) = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        register,
        serde_json::json!({ "type": "register", "userId": "4242", "provider": "discord" })
    );
    assert_eq!(close, Some(CloseCode::Normal));

    wait_for_state(&channel, ConnectionState::Disconnected).await;
    expect_no_event(&mut events).await;
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_are_ignored() {
    let (url, server) = spawn_server(|mut ws| async move {
        read_register(&mut ws).await;
        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        send_json(&mut ws, serde_json::json!({ "type": "registered" })).await;
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        send_json(
            &mut ws,
            serde_json::json!({ "type": "authFailed", "provider": "discord", "error": "denied" }),
        )
        .await;
        await_close(&mut ws).await
    })
    .await;

    let (channel, mut events) = SocketChannel::new(url);
    channel.start_auth("4242", "discord").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ChannelEvent::AuthFailed {
            provider: "discord".to_string(),
            error: "denied".to_string()
        }
    );
    assert_eq!(server.await.unwrap(), Some(CloseCode::Normal));
    expect_no_event(&mut events).await;
}

#[tokio::test]
async fn test_server_drop_reports_disconnected() {
    let (url, server) = spawn_server(|mut ws| async move {
        read_register(&mut ws).await;
        drop(ws);
    })
    .await;

    let (channel, mut events) = SocketChannel::new(url);
    channel.start_auth("4242", "discord").await.unwrap();
    server.await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ChannelEvent::Disconnected);
    wait_for_state(&channel, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_dispose_suppresses_disconnected() {
    let (url, _server) = spawn_server(|mut ws| async move {
        read_register(&mut ws).await;
        // Hold the connection until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let (channel, mut events) = SocketChannel::new(url);
    channel.start_auth("4242", "discord").await.unwrap();
    channel.dispose();

    assert!(channel.is_disposed());
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    expect_no_event(&mut events).await;
}

#[tokio::test]
async fn test_second_start_auth_reuses_open_connection() {
    let (url, server) = spawn_server(|mut ws| async move {
        let first = read_register(&mut ws).await;
        let second = read_register(&mut ws).await;
        (first, second)
    })
    .await;

    let (channel, _events) = SocketChannel::new(url);
    channel.start_auth("1", "discord").await.unwrap();
    channel.start_auth("2", "discord").await.unwrap();

    let (first, second) = server.await.unwrap();
    assert_eq!(first["userId"], "1");
    assert_eq!(second["userId"], "2");
}

// ============================================================================
// Coordinator end to end
// ============================================================================

#[derive(Default)]
struct RecordingBrowser {
    opened: Mutex<Vec<String>>,
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        self.opened.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

struct Flow {
    coordinator: AuthCoordinator,
    channel: SocketChannel,
    links: Arc<PlatformLinks>,
    browser: Arc<RecordingBrowser>,
    seen: Arc<Mutex<Vec<AuthLifecycleEvent>>>,
}

fn flow(url: String) -> Flow {
    let identity: Arc<dyn IdentityProvider> = Arc::new(SharedIdentity::new(4242));
    let bus = Arc::new(EventBus::new());
    let links = Arc::new(PlatformLinks::default());
    let browser = Arc::new(RecordingBrowser::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(move |event: &AuthLifecycleEvent| sink.lock().unwrap().push(*event));

    let (channel, channel_events) = SocketChannel::new(url);
    let launchers = Launchers::standard(
        &channel,
        "https://bloombell.maot.dev/callback",
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    );
    let coordinator = AuthCoordinator::new(identity, bus, launchers, Arc::clone(&links), channel_events);

    Flow {
        coordinator,
        channel,
        links,
        browser,
        seen,
    }
}

impl Flow {
    async fn wait_for_states(&self, count: usize) -> Vec<AuthState> {
        for _ in 0..200 {
            if self.seen.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.seen.lock().unwrap().iter().map(|e| e.state).collect()
    }
}

#[tokio::test]
async fn test_flow_completion_links_provider() {
    let (url, server) = spawn_server(|mut ws| async move {
        let register = read_register(&mut ws).await;
        send_json(
            &mut ws,
            serde_json::json!({ "type": "authComplete", "provider": "discord", "userId": "4242" }),
        )
        .await;
        await_close(&mut ws).await;
        register
    })
    .await;
    let flow = flow(url);

    assert_eq!(flow.coordinator.authenticate_with("discord"), Ok(Provider::Discord));
    let states = flow.wait_for_states(2).await;

    assert_eq!(states, vec![AuthState::Started, AuthState::Completed]);
    assert!(flow.links.snapshot().discord);
    assert!(!flow.coordinator.is_authenticating());

    let register = server.await.unwrap();
    assert_eq!(register["userId"], "4242");
    assert_eq!(register["provider"], "discord");

    let opened = flow.browser.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].starts_with("https://discord.com/api/oauth2/authorize?"));
    assert!(opened[0].contains("state=4242"));
}

#[tokio::test]
async fn test_flow_disconnect_cancels_exactly_once() {
    let (url, _server) = spawn_server(|mut ws| async move {
        read_register(&mut ws).await;
        drop(ws);
    })
    .await;
    let flow = flow(url);

    flow.coordinator.authenticate_with("discord").unwrap();
    assert_eq!(
        flow.coordinator.authenticate_with("discord"),
        Err(bloombell::auth::AuthError::AlreadyInProgress(Provider::Discord))
    );

    let states = flow.wait_for_states(2).await;
    assert_eq!(states, vec![AuthState::Started, AuthState::Cancelled]);
    assert!(!flow.links.snapshot().discord);
}

#[tokio::test]
async fn test_flow_failure_frame() {
    let (url, _server) = spawn_server(|mut ws| async move {
        read_register(&mut ws).await;
        send_json(
            &mut ws,
            serde_json::json!({ "type": "authFailed", "provider": "discord", "error": "access_denied" }),
        )
        .await;
        await_close(&mut ws).await;
    })
    .await;
    let flow = flow(url);

    flow.coordinator.authenticate_with("discord").unwrap();
    let states = flow.wait_for_states(2).await;

    assert_eq!(states, vec![AuthState::Started, AuthState::Failed]);
    assert!(!flow.links.snapshot().discord);
}

#[tokio::test]
async fn test_flow_unreachable_backend_fails() {
    let flow = flow("ws://127.0.0.1:1".to_string());

    flow.coordinator.authenticate_with("discord").unwrap();
    let states = flow.wait_for_states(2).await;

    assert_eq!(states, vec![AuthState::Started, AuthState::Failed]);
    assert!(flow.browser.opened.lock().unwrap().is_empty());
    flow.channel.dispose();
}
