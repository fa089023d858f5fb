//! Realtime connection to the backend notification channel.
//!
//! A [`Connection`] owns one background driver task. The driver performs
//! handshakes one at a time, keeps the session alive, dispatches inbound
//! events to listeners and retries with a linear, capped backoff after any
//! failure until it is stopped.

use crate::bus::{BusSubscription, EventBus};
use crate::error::{ClientError, Result};
use crate::protocol::{
    EnginePacket, OpenHandshake, SocketPacket, connect_error_message, encode_engine_packet,
    encode_frame, parse_engine_packet, parse_socket_packet, socket_url,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_ROOM: &str = "global";

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";
/// Emitted whenever the state enters `Connecting`; the payload is the attempt number.
pub const EVENT_CONNECTING: &str = "connecting";
pub const EVENT_RECONNECT_ATTEMPT: &str = "reconnect_attempt";
pub const EVENT_SERVER_NOTIFY: &str = "server:notify";
pub const EVENT_HEARTBEAT_REPLY: &str = "pong:server";

pub const COMMAND_ROOM_JOIN: &str = "room:join";
pub const COMMAND_ROOM_LEAVE: &str = "room:leave";
pub const COMMAND_CHAT_MESSAGE: &str = "chat:message";
pub const COMMAND_HEARTBEAT_PING: &str = "ping:client";

/// Disconnect reason reported when the client closes the session itself.
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry schedule used after a failed handshake or a lost session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5_000),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): grows linearly, then caps.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.max(self.initial_delay);
        self.initial_delay
            .checked_mul(attempt.max(1))
            .map_or(ceiling, |delay| delay.min(ceiling))
    }

    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|limit| attempt <= limit)
    }
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Room joined after every successful handshake.
    pub default_room: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            default_room: DEFAULT_ROOM.to_string(),
        }
    }
}

enum Command {
    Emit(SocketPacket),
    Close,
}

struct Driver {
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<Command>,
}

/// State shared between a connection handle and its driver task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    listeners: EventBus,
    reconnect_attempts: AtomicU32,
    session_id: RwLock<Option<String>>,
}

impl Shared {
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn dispatch(&self, event: &str, payload: &Value) -> usize {
        self.listeners.publish(event, payload)
    }

    fn set_session_id(&self, session_id: Option<String>) {
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    fn mark_connecting(&self, attempt: u32) {
        if self.transition(ConnectionState::Connecting) {
            self.dispatch(EVENT_CONNECTING, &json!(attempt));
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        self.set_session_id(None);
        if self.transition(ConnectionState::Disconnected) {
            self.dispatch(EVENT_DISCONNECT, &json!(reason));
        }
    }
}

/// One realtime connection.
///
/// Created and replaced by [`ConnectionManager`](crate::ConnectionManager);
/// callers observe it and emit commands but cannot start or stop it.
pub struct Connection {
    origin: String,
    path: String,
    url: Url,
    config: ConnectionConfig,
    token: RwLock<Option<String>>,
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl Connection {
    /// Validate the endpoint and build an idle connection.
    pub(crate) fn new(
        origin: &str,
        path: &str,
        token: Option<String>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let url = socket_url(origin, path)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            origin: origin.trim().to_string(),
            path: path.trim().to_string(),
            url,
            config,
            token: RwLock::new(token),
            shared: Arc::new(Shared {
                state,
                listeners: EventBus::new(),
                reconnect_attempts: AtomicU32::new(0),
                session_id: RwLock::new(None),
            }),
            driver: Mutex::new(None),
        })
    }

    /// Resolved WebSocket URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Server origin the connection was created for.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Transport path the connection was created for.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Token carried by the next handshake.
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Retry attempts since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Server-assigned session id while connected.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Listen for an inbound event or a lifecycle event (`connecting`,
    /// `connect`, `disconnect`, `connect_error`, `reconnect_attempt`).
    pub fn on<F>(&self, event: &str, handler: F) -> BusSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(event, handler)
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.shared.listeners.subscriber_count(event)
    }

    /// Send an event with one argument over the live session.
    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.send_command(SocketPacket::event(event, payload))
    }

    pub fn join_room(&self, room: &str) -> Result<()> {
        self.emit(COMMAND_ROOM_JOIN, json!(room))
    }

    pub fn leave_room(&self, room: &str) -> Result<()> {
        self.emit(COMMAND_ROOM_LEAVE, json!(room))
    }

    pub fn send_chat(&self, room: &str, message: &str) -> Result<()> {
        self.emit(
            COMMAND_CHAT_MESSAGE,
            json!({ "room": room, "message": message }),
        )
    }

    /// Liveness probe; the server answers with `pong:server`.
    pub fn ping_server(&self) -> Result<()> {
        self.send_command(heartbeat_ping())
    }

    fn send_command(&self, packet: SocketPacket) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        let driver = driver.as_ref().ok_or(ClientError::NotConnected)?;
        driver
            .commands
            .send(Command::Emit(packet))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Deliver an event to listeners as if the server had sent it.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) -> usize {
        self.shared.dispatch(event, payload)
    }

    /// Spawn the driver. Must run inside a Tokio runtime.
    pub(crate) fn start(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return;
        }

        self.shared.reconnect_attempts.store(0, Ordering::Release);
        self.shared.mark_connecting(0);

        let (commands, receiver) = mpsc::unbounded_channel();
        let context = DriverContext {
            url: self.url.clone(),
            token: self.token(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
        };
        let task = tokio::spawn(context.run(receiver));
        *driver = Some(Driver { task, commands });
    }

    /// Close the session and stop retrying. Safe to call repeatedly.
    pub(crate) async fn stop(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Driver { mut task, commands }) = driver {
            let _ = commands.send(Command::Close);
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }

        self.shared.mark_disconnected(CLIENT_DISCONNECT_REASON);
    }

    /// Swap the handshake token and run a fresh handshake with it.
    pub(crate) async fn restart_with_token(&self, token: Option<String>) {
        self.stop().await;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
        self.start();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

fn heartbeat_ping() -> SocketPacket {
    SocketPacket::Event {
        name: COMMAND_HEARTBEAT_PING.to_string(),
        args: Vec::new(),
        ack_id: None,
    }
}

/// Everything the driver task needs, detached from the connection handle.
struct DriverContext {
    url: Url,
    token: Option<String>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
}

struct Session {
    writer: WsWriter,
    reader: WsReader,
    open: OpenHandshake,
    session_id: Option<String>,
}

enum SessionEnd {
    ClientClosed,
    Lost(String),
}

impl DriverContext {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                if !self.config.reconnect.allows(attempt) {
                    warn!(url = %self.url, attempt, "reconnect attempts exhausted");
                    return;
                }
                self.shared
                    .reconnect_attempts
                    .store(attempt, Ordering::Release);
                let delay = self.config.reconnect.delay_for(attempt);
                debug!(url = %self.url, attempt, ?delay, "waiting before reconnect");
                if !wait_before_retry(delay, &mut commands).await {
                    return;
                }
                self.shared.dispatch(EVENT_RECONNECT_ATTEMPT, &json!(attempt));
            }

            self.shared.mark_connecting(attempt);
            let handshake = timeout(
                self.config.handshake_timeout,
                handshake(&self.url, self.token.as_deref()),
            )
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "handshake timeout after {:?}",
                    self.config.handshake_timeout
                ))
            })
            .and_then(|result| result);

            match handshake {
                Ok(session) => {
                    attempt = 0;
                    self.shared.reconnect_attempts.store(0, Ordering::Release);
                    match self.run_session(session, &mut commands).await {
                        SessionEnd::ClientClosed => {
                            self.shared.mark_disconnected(CLIENT_DISCONNECT_REASON);
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(url = %self.url, %reason, "realtime session lost");
                            self.shared.mark_disconnected(&reason);
                        }
                    }
                }
                Err(error) => {
                    warn!(url = %self.url, %error, "realtime connect_error");
                    self.shared.set_session_id(None);
                    self.shared.transition(ConnectionState::Disconnected);
                    self.shared.dispatch(
                        EVENT_CONNECT_ERROR,
                        &json!({ "message": error.to_string() }),
                    );
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }

    async fn run_session(
        &self,
        session: Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let Session {
            mut writer,
            mut reader,
            open,
            session_id,
        } = session;

        if close_requested(commands) {
            let _ = send_packet(&mut writer, &SocketPacket::Disconnect).await;
            let _ = writer.send(Message::Close(None)).await;
            return SessionEnd::ClientClosed;
        }

        self.shared.set_session_id(session_id.clone());
        self.shared.transition(ConnectionState::Connected);
        info!(url = %self.url, sid = ?session_id, "realtime connected");
        self.shared.dispatch(EVENT_CONNECT, &json!({ "sid": session_id }));

        let greetings = [
            SocketPacket::event(COMMAND_ROOM_JOIN, json!(self.config.default_room)),
            heartbeat_ping(),
        ];
        for packet in &greetings {
            if let Err(error) = send_packet(&mut writer, packet).await {
                warn!(url = %self.url, %error, "post-connect command failed");
            }
        }

        let window = open.liveness_window();
        let mut deadline = Instant::now() + window;

        loop {
            tokio::select! {
                frame = timeout_at(deadline, next_engine_packet(&mut reader)) => {
                    let packet = match frame {
                        Err(_) => return SessionEnd::Lost("ping timeout".to_string()),
                        Ok(Err(error)) => return SessionEnd::Lost(error.to_string()),
                        Ok(Ok(packet)) => packet,
                    };
                    deadline = Instant::now() + window;

                    match packet {
                        EnginePacket::Ping(body) => {
                            let pong = EnginePacket::Pong(body);
                            if let Err(error) = send_engine(&mut writer, &pong).await {
                                return SessionEnd::Lost(error.to_string());
                            }
                        }
                        EnginePacket::Message(body) => match parse_socket_packet(&body) {
                            Ok(SocketPacket::Event { name, args, .. }) => {
                                let payload = args.into_iter().next().unwrap_or(Value::Null);
                                let delivered = self.shared.dispatch(&name, &payload);
                                debug!(event = %name, delivered, "realtime event");
                            }
                            Ok(SocketPacket::Disconnect) => {
                                return SessionEnd::Lost("io server disconnect".to_string());
                            }
                            Ok(SocketPacket::ConnectError(data)) => {
                                return SessionEnd::Lost(connect_error_message(&data));
                            }
                            Ok(_) => {}
                            Err(error) => {
                                warn!(url = %self.url, %error, "realtime protocol parse error");
                            }
                        },
                        EnginePacket::Close => {
                            return SessionEnd::Lost("transport close".to_string());
                        }
                        EnginePacket::Open(_)
                        | EnginePacket::Pong(_)
                        | EnginePacket::Upgrade
                        | EnginePacket::Noop => {}
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Emit(packet)) => {
                        if let Err(error) = send_packet(&mut writer, &packet).await {
                            return SessionEnd::Lost(error.to_string());
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = send_packet(&mut writer, &SocketPacket::Disconnect).await;
                        let _ = writer.send(Message::Close(None)).await;
                        return SessionEnd::ClientClosed;
                    }
                },
            }
        }
    }
}

/// Sleep out a backoff delay; returns `false` when told to stop instead.
async fn wait_before_retry(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Emit(packet)) => {
                    debug!(?packet, "dropping command while reconnecting");
                }
                Some(Command::Close) | None => return false,
            },
        }
    }
}

/// Drain commands queued while the handshake ran; `true` when a close is among them.
fn close_requested(commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(Command::Close) | Err(TryRecvError::Disconnected) => return true,
            Ok(Command::Emit(packet)) => debug!(?packet, "dropping command queued before connect"),
            Err(TryRecvError::Empty) => return false,
        }
    }
}

/// Open the WebSocket, read the Engine.IO open packet and authenticate the
/// namespace connect with `token`.
async fn handshake(url: &Url, token: Option<&str>) -> Result<Session> {
    let (stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|error| ClientError::WebSocket(error.to_string()))?;
    let (mut writer, mut reader) = stream.split();

    let open = loop {
        match next_engine_packet(&mut reader).await? {
            EnginePacket::Open(open) => break open,
            EnginePacket::Noop => {}
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )));
            }
        }
    };

    send_packet(&mut writer, &SocketPacket::connect_with_token(token)).await?;

    loop {
        match next_engine_packet(&mut reader).await? {
            EnginePacket::Ping(body) => send_engine(&mut writer, &EnginePacket::Pong(body)).await?,
            EnginePacket::Message(body) => match parse_socket_packet(&body)? {
                SocketPacket::Connect(data) => {
                    let session_id = data
                        .as_ref()
                        .and_then(|data| data.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    return Ok(Session {
                        writer,
                        reader,
                        open,
                        session_id,
                    });
                }
                SocketPacket::ConnectError(data) => {
                    return Err(ClientError::Connection(connect_error_message(&data)));
                }
                other => debug!(?other, "ignoring packet before connect acknowledgement"),
            },
            EnginePacket::Close => {
                return Err(ClientError::Connection(
                    "server closed during handshake".to_string(),
                ));
            }
            _ => {}
        }
    }
}

async fn next_engine_packet(reader: &mut WsReader) -> Result<EnginePacket> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => return parse_engine_packet(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::Connection("websocket closed".to_string()));
            }
            Some(Ok(
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_),
            )) => {}
            Some(Err(error)) => return Err(ClientError::WebSocket(error.to_string())),
        }
    }
}

async fn send_engine(writer: &mut WsWriter, packet: &EnginePacket) -> Result<()> {
    send_text(writer, encode_engine_packet(packet)?).await
}

async fn send_packet(writer: &mut WsWriter, packet: &SocketPacket) -> Result<()> {
    send_text(writer, encode_frame(packet)?).await
}

async fn send_text(writer: &mut WsWriter, text: String) -> Result<()> {
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|error| ClientError::WebSocket(error.to_string()))
}
