//! Client for the agent chat backend.
//!
//! This crate exposes:
//! - one managed realtime connection (Socket.IO over WebSocket) with retry
//!   and callback wiring for live domain events
//! - reply normalization from the chat endpoint's body shapes to text
//! - an in-process topic bus
//! - login/chat HTTP calls, token persistence and the session flow

pub mod api;
pub mod bus;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod reply;
pub mod session;
pub mod store;
pub mod wiring;

pub use api::{AgentApiClient, ChatBackend};
pub use bus::{BusHandler, BusSubscription, EventBus};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionConfig, ConnectionState, ReconnectPolicy};
pub use conversation::{ChatMessage, Conversation, Role};
pub use error::{ClientError, Result};
pub use manager::ConnectionManager;
pub use reply::{ReplyShape, extract_fragments, summarize_step, unwrap_nested_json};
pub use session::SessionController;
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use wiring::{
    DomainEvent, DomainEventKind, Project, TeamMember, WiringHandle, WiringHandlers, wire,
};
