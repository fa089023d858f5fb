#![expect(dead_code, reason = "each test binary uses a subset of the helpers")]

use agent_chat_client::{Connection, ConnectionConfig, ConnectionState, ReconnectPolicy};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, oneshot};

pub const WAIT: Duration = Duration::from_secs(10);
pub const USERNAME: &str = "ada";
pub const PASSWORD: &str = "analytical-engine";
pub const ISSUED_TOKEN: &str = "tok-ada";

/// What the chat endpoint answers with.
#[derive(Debug, Clone)]
pub enum ChatReply {
    Json(Value),
    Text(String),
    Status(u16, String),
}

/// Commands pushed from a test into every live realtime session.
#[derive(Debug, Clone)]
pub enum Push {
    Frame(String),
    Drop,
}

#[derive(Clone)]
pub struct BackendState {
    pub handshakes: Arc<Mutex<Vec<Value>>>,
    pub frames: Arc<Mutex<Vec<String>>>,
    pub chat_requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    pub chat_reply: Arc<Mutex<ChatReply>>,
    pub rejected_tokens: Arc<Mutex<Vec<String>>>,
    pub sessions: Arc<AtomicUsize>,
    pub ping_on_connect: bool,
    push: broadcast::Sender<Push>,
}

pub struct MockBackend {
    pub base_url: String,
    pub state: BackendState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(false).await
    }

    pub async fn spawn_with(ping_on_connect: bool) -> Result<Self> {
        let (push, _) = broadcast::channel(64);
        let state = BackendState {
            handshakes: Arc::new(Mutex::new(Vec::new())),
            frames: Arc::new(Mutex::new(Vec::new())),
            chat_requests: Arc::new(Mutex::new(Vec::new())),
            chat_reply: Arc::new(Mutex::new(ChatReply::Json(json!({"result": "ok"})))),
            rejected_tokens: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(AtomicUsize::new(0)),
            ping_on_connect,
            push,
        };

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/agent/chat", post(chat))
            .route("/socket.io/", get(socket_io))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Send a raw Engine.IO frame to every connected client.
    pub fn push_frame(&self, frame: &str) {
        let _ = self.state.push.send(Push::Frame(frame.to_string()));
    }

    /// Close every live realtime session from the server side.
    pub fn drop_sessions(&self) {
        let _ = self.state.push.send(Push::Drop);
    }

    pub async fn set_chat_reply(&self, reply: ChatReply) {
        *self.state.chat_reply.lock().await = reply;
    }

    pub async fn reject_token(&self, token: &str) {
        self.state.rejected_tokens.lock().await.push(token.to_string());
    }

    /// Tokens presented in namespace connect packets, in order.
    pub async fn handshake_tokens(&self) -> Vec<Option<String>> {
        self.state
            .handshakes
            .lock()
            .await
            .iter()
            .map(|auth| auth.get("token").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub async fn frames(&self) -> Vec<String> {
        self.state.frames.lock().await.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(Json(body): Json<LoginBody>) -> (StatusCode, Json<Value>) {
    match (body.username.as_str(), body.password.as_str()) {
        (USERNAME, PASSWORD) => (StatusCode::OK, Json(json!({ "token": ISSUED_TOKEN }))),
        ("tokenless", _) => (StatusCode::OK, Json(json!({}))),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        ),
    }
}

async fn chat(
    headers: HeaderMap,
    State(state): State<BackendState>,
    Json(body): Json<Value>,
) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    state.chat_requests.lock().await.push((bearer, body));

    match state.chat_reply.lock().await.clone() {
        ChatReply::Json(value) => (StatusCode::OK, Json(value)).into_response(),
        ChatReply::Text(text) => (StatusCode::OK, text).into_response(),
        ChatReply::Status(code, body) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        )
            .into_response(),
    }
}

async fn socket_io(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<BackendState>,
) -> Response {
    let versioned = query.get("EIO").map(String::as_str) == Some("4")
        && query.get("transport").map(String::as_str) == Some("websocket");
    if !versioned {
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| socket_session(state, socket))
}

async fn socket_session(state: BackendState, mut socket: WebSocket) {
    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    let open = json!({
        "sid": format!("eio-{session}"),
        "upgrades": [],
        "pingInterval": 25_000,
        "pingTimeout": 20_000,
        "maxPayload": 1_000_000
    });
    if socket.send(Message::Text(format!("0{open}"))).await.is_err() {
        return;
    }

    let auth = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(body) = text.strip_prefix("40") {
                    break serde_json::from_str::<Value>(body).unwrap_or_else(|_| json!({}));
                }
            }
            Some(Ok(_)) => {}
            _ => return,
        }
    };
    let token = auth
        .get("token")
        .and_then(Value::as_str)
        .map(str::to_string);
    state.handshakes.lock().await.push(auth);

    let rejected = match &token {
        Some(token) => state.rejected_tokens.lock().await.contains(token),
        None => true,
    };
    if rejected {
        let _ = socket
            .send(Message::Text(r#"44{"message":"unauthorized"}"#.to_string()))
            .await;
        return;
    }

    let mut pushes = state.push.subscribe();
    let ack = json!({ "sid": format!("sock-{session}") });
    if socket.send(Message::Text(format!("40{ack}"))).await.is_err() {
        return;
    }
    if state.ping_on_connect && socket.send(Message::Text("2".to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.frames.lock().await.push(text.clone());
                    if text.starts_with(r#"42["ping:client""#) {
                        let reply = r#"42["pong:server",{"ok":true}]"#.to_string();
                        if socket.send(Message::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                    if text == "41" {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok(Push::Frame(frame)) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(Push::Drop) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Connection settings with short retry delays for loopback tests.
pub fn quick_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: None,
        },
        ..ConnectionConfig::default()
    }
}

pub async fn wait_for_state(connection: &Connection, target: ConnectionState) -> Result<()> {
    let mut states = connection.watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state == target)).await??;
    Ok(())
}

/// Poll `check` until it returns true or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(check: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}
