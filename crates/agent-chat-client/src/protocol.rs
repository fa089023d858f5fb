//! Engine.IO v4 / Socket.IO v5 text framing over a raw WebSocket.
//!
//! Only the default namespace and text packets are supported; binary
//! attachments are rejected as protocol errors.

use crate::error::{ClientError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const ENGINE_IO_VERSION: &str = "4";
pub const DEFAULT_SOCKET_PATH: &str = "/socket.io";

/// Engine.IO open packet body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// How long the session may stay silent before it is considered lost.
    #[must_use]
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// Engine.IO transport-level packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

/// Socket.IO packet in the default namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    /// Build an event packet carrying a single argument.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            name: name.into(),
            args: vec![payload],
            ack_id: None,
        }
    }

    /// Build the namespace connect packet carrying handshake auth data.
    #[must_use]
    pub fn connect_with_token(token: Option<&str>) -> Self {
        let auth = match token {
            Some(token) if !token.is_empty() => serde_json::json!({ "token": token }),
            _ => serde_json::json!({}),
        };
        Self::Connect(Some(auth))
    }
}

/// Parse one Engine.IO text frame.
pub fn parse_engine_packet(text: &str) -> Result<EnginePacket> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ClientError::Protocol("empty engine packet".to_string()))?;
    let body = chars.as_str();

    match kind {
        '0' => {
            let handshake: OpenHandshake = serde_json::from_str(body).map_err(|error| {
                ClientError::Protocol(format!("invalid open packet: {}", error))
            })?;
            Ok(EnginePacket::Open(handshake))
        }
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(body.to_string())),
        '3' => Ok(EnginePacket::Pong(body.to_string())),
        '4' => Ok(EnginePacket::Message(body.to_string())),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(ClientError::Protocol(format!(
            "unknown engine packet type '{}'",
            other
        ))),
    }
}

/// Encode an Engine.IO packet as a text frame.
pub fn encode_engine_packet(packet: &EnginePacket) -> Result<String> {
    Ok(match packet {
        EnginePacket::Open(_) => {
            return Err(ClientError::Protocol(
                "open packets are server-originated".to_string(),
            ));
        }
        EnginePacket::Close => "1".to_string(),
        EnginePacket::Ping(body) => format!("2{}", body),
        EnginePacket::Pong(body) => format!("3{}", body),
        EnginePacket::Message(body) => format!("4{}", body),
        EnginePacket::Upgrade => "5".to_string(),
        EnginePacket::Noop => "6".to_string(),
    })
}

/// Parse the Socket.IO payload carried by an Engine.IO message packet.
pub fn parse_socket_packet(text: &str) -> Result<SocketPacket> {
    let mut rest = text;
    let kind = rest
        .chars()
        .next()
        .ok_or_else(|| ClientError::Protocol("empty socket packet".to_string()))?;
    rest = &rest[kind.len_utf8()..];
    if matches!(kind, '5' | '6') {
        return Err(ClientError::Protocol(
            "binary socket packets are not supported".to_string(),
        ));
    }

    if rest.starts_with('/') {
        let (namespace, remainder) = rest.split_once(',').unwrap_or((rest, ""));
        if namespace != "/" {
            return Err(ClientError::Protocol(format!(
                "unsupported namespace {}",
                namespace
            )));
        }
        rest = remainder;
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let ack_id = if digits > 0 {
        let parsed = rest[..digits]
            .parse::<u64>()
            .map_err(|error| ClientError::Protocol(format!("invalid ack id: {}", error)))?;
        rest = &rest[digits..];
        Some(parsed)
    } else {
        None
    };

    let data = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<Value>(rest).map_err(|error| {
            ClientError::Protocol(format!("invalid socket packet data: {}", error))
        })?)
    };

    match kind {
        '0' => Ok(SocketPacket::Connect(data)),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let mut args = match data {
                Some(Value::Array(args)) => args,
                _ => {
                    return Err(ClientError::Protocol(
                        "EVENT payload must be an array".to_string(),
                    ));
                }
            };
            if args.is_empty() {
                return Err(ClientError::Protocol("EVENT missing name".to_string()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => {
                    return Err(ClientError::Protocol(
                        "EVENT name must be a string".to_string(),
                    ));
                }
            };
            Ok(SocketPacket::Event { name, args, ack_id })
        }
        '3' => {
            let ack_id =
                ack_id.ok_or_else(|| ClientError::Protocol("ACK missing id".to_string()))?;
            let args = match data {
                Some(Value::Array(args)) => args,
                _ => Vec::new(),
            };
            Ok(SocketPacket::Ack { ack_id, args })
        }
        '4' => Ok(SocketPacket::ConnectError(data.unwrap_or(Value::Null))),
        other => Err(ClientError::Protocol(format!(
            "unknown socket packet type '{}'",
            other
        ))),
    }
}

/// Encode a Socket.IO packet (without the Engine.IO message prefix).
pub fn encode_socket_packet(packet: &SocketPacket) -> Result<String> {
    Ok(match packet {
        SocketPacket::Connect(None) => "0".to_string(),
        SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
        SocketPacket::Disconnect => "1".to_string(),
        SocketPacket::Event { name, args, ack_id } => {
            let mut frame = Vec::with_capacity(args.len() + 1);
            frame.push(Value::String(name.clone()));
            frame.extend(args.iter().cloned());
            let ack = ack_id.map(|id| id.to_string()).unwrap_or_default();
            format!("2{}{}", ack, serde_json::to_string(&frame)?)
        }
        SocketPacket::Ack { ack_id, args } => {
            format!("3{}{}", ack_id, serde_json::to_string(args)?)
        }
        SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
    })
}

/// Encode a Socket.IO packet as a complete Engine.IO text frame.
pub fn encode_frame(packet: &SocketPacket) -> Result<String> {
    encode_engine_packet(&EnginePacket::Message(encode_socket_packet(packet)?))
}

/// Human-readable message from a CONNECT_ERROR payload.
#[must_use]
pub fn connect_error_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| data.as_str().map(str::to_string))
        .unwrap_or_else(|| data.to_string())
}

/// Resolve the WebSocket URL for a server origin and transport path.
///
/// `http`/`https` origins map to `ws`/`wss`; the Engine.IO version and
/// transport are added as query parameters.
pub fn socket_url(origin: &str, path: &str) -> Result<Url> {
    let mut url = Url::parse(origin.trim())
        .map_err(|error| ClientError::InvalidUrl(format!("{}: {error}", origin.trim())))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use http(s):// or ws(s):// scheme, got: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let trimmed = path.trim().trim_matches('/');
    let trimmed = if trimmed.is_empty() {
        DEFAULT_SOCKET_PATH.trim_matches('/')
    } else {
        trimmed
    };
    url.set_path(&format!("/{}/", trimmed));
    url.set_query(Some(&format!(
        "EIO={}&transport=websocket",
        ENGINE_IO_VERSION
    )));
    Ok(url)
}
