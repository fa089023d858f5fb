//! Chat transcript for one interactive session.

use crate::api::ChatBackend;
use crate::error::Result;
use crate::reply::extract_fragments;
use crate::wiring::DomainEvent;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const WELCOME_MESSAGE: &str =
    "Hi! Ask me about your team or projects. Live updates will show up here.";
pub const CONNECTION_ERROR_MESSAGE: &str = "Error connecting to the agent backend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered messages plus the in-flight flag for the current turn.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    busy: bool,
}

impl Conversation {
    /// A transcript seeded with the welcome message.
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::new(Role::Assistant, WELCOME_MESSAGE)],
            busy: false,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Record the user's input and mark the turn in flight.
    ///
    /// Returns the trimmed text to send, or `None` for blank input or while
    /// another turn is in flight.
    pub fn begin_turn(&mut self, input: &str) -> Option<String> {
        let text = input.trim();
        if text.is_empty() || self.busy {
            return None;
        }
        self.messages.push(ChatMessage::new(Role::User, text));
        self.busy = true;
        Some(text.to_string())
    }

    /// Append the reply of the in-flight turn and clear the busy flag.
    ///
    /// Returns the messages this call appended.
    pub fn finish_turn(&mut self, reply: Result<Value>) -> &[ChatMessage] {
        let start = self.messages.len();
        match reply {
            Ok(payload) => {
                self.messages.extend(
                    extract_fragments(&payload)
                        .into_iter()
                        .map(|fragment| ChatMessage::new(Role::Assistant, fragment)),
                );
            }
            Err(error) => {
                warn!(%error, connectivity = error.is_connectivity(), "chat turn failed");
                self.messages
                    .push(ChatMessage::new(Role::Assistant, CONNECTION_ERROR_MESSAGE));
            }
        }
        self.busy = false;
        &self.messages[start..]
    }

    /// Append a system message describing a live notification.
    pub fn push_domain_event(&mut self, event: &DomainEvent) -> &ChatMessage {
        self.messages
            .push(ChatMessage::new(Role::System, event.summary()));
        let last = self.messages.len() - 1;
        &self.messages[last]
    }

    /// Run one full turn against `backend`.
    ///
    /// Returns `None` when the input was rejected by [`begin_turn`](Self::begin_turn).
    pub async fn submit(
        &mut self,
        backend: &dyn ChatBackend,
        token: Option<&str>,
        input: &str,
    ) -> Option<&[ChatMessage]> {
        let text = self.begin_turn(input)?;
        let reply = backend.chat(token, &text).await;
        Some(self.finish_turn(reply))
    }
}
