//! Attaching UI callbacks to a connection.
//!
//! [`wire`] registers one listener per recognized event and hands back a
//! [`WiringHandle`] that removes exactly those listeners again.

use crate::bus::{BusSubscription, EventBus};
use crate::connection::{
    Connection, ConnectionState, EVENT_CONNECT, EVENT_CONNECT_ERROR, EVENT_CONNECTING,
    EVENT_DISCONNECT, EVENT_HEARTBEAT_REPLY, EVENT_RECONNECT_ATTEMPT, EVENT_SERVER_NOTIFY,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info};

pub type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type DomainCallback = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Server-pushed change notifications the UI reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    TeamMemberCreated,
    ProjectCreated,
    ProjectDeleted,
    ProjectUpdated,
}

impl DomainEventKind {
    pub const ALL: [Self; 4] = [
        Self::TeamMemberCreated,
        Self::ProjectCreated,
        Self::ProjectDeleted,
        Self::ProjectUpdated,
    ];

    /// Wire event name, also used as the bus topic.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TeamMemberCreated => "team-member:created",
            Self::ProjectCreated => "project:created",
            Self::ProjectDeleted => "project:deleted",
            Self::ProjectUpdated => "project:updated",
        }
    }

    #[must_use]
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity id as the backend serializes it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Text(String),
    Number(i64),
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TeamMember {
    #[serde(alias = "_id")]
    pub id: Option<EntityId>,
    pub name: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub position: Option<String>,
    pub allocated: Option<bool>,
}

impl TeamMember {
    /// `name lastname`, falling back to the email or id.
    #[must_use]
    pub fn display_name(&self) -> String {
        let full = [self.name.as_deref(), self.lastname.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return full;
        }
        self.email
            .clone()
            .or_else(|| self.id.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Project {
    #[serde(alias = "_id")]
    pub id: Option<EntityId>,
    pub name: Option<String>,
}

impl Project {
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| self.id.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// One domain notification with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub payload: Value,
}

impl DomainEvent {
    /// Typed view of a `team-member:created` payload.
    #[must_use]
    pub fn team_member(&self) -> Option<TeamMember> {
        match self.kind {
            DomainEventKind::TeamMemberCreated => {
                serde_json::from_value(self.payload.clone()).ok()
            }
            _ => None,
        }
    }

    /// Typed view of a `project:*` payload.
    #[must_use]
    pub fn project(&self) -> Option<Project> {
        match self.kind {
            DomainEventKind::TeamMemberCreated => None,
            _ => serde_json::from_value(self.payload.clone()).ok(),
        }
    }

    /// One-line description for a conversation log.
    #[must_use]
    pub fn summary(&self) -> String {
        let subject = match self.kind {
            DomainEventKind::TeamMemberCreated => self
                .team_member()
                .map(|member| match member.position.as_deref() {
                    Some(position) if !position.trim().is_empty() => {
                        format!("{} ({})", member.display_name(), position.trim())
                    }
                    _ => member.display_name(),
                }),
            _ => self.project().map(|project| project.display_name()),
        }
        .unwrap_or_else(|| "unknown".to_string());

        let verb = match self.kind {
            DomainEventKind::TeamMemberCreated => "Team member added",
            DomainEventKind::ProjectCreated => "Project created",
            DomainEventKind::ProjectDeleted => "Project deleted",
            DomainEventKind::ProjectUpdated => "Project updated",
        };
        format!("{verb}: {subject}")
    }
}

/// Callbacks to attach to a connection. Every callback is optional.
#[derive(Clone, Default)]
pub struct WiringHandlers {
    status: Option<StatusCallback>,
    domain: HashMap<DomainEventKind, Vec<DomainCallback>>,
}

impl WiringHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives the current state right away, then every change.
    pub fn on_status<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.status = Some(Arc::new(handler));
        self
    }

    pub fn on_domain<F>(mut self, kind: DomainEventKind, handler: F) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.domain.entry(kind).or_default().push(Arc::new(handler));
        self
    }

    pub fn on_team_created<F>(self, handler: F) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.on_domain(DomainEventKind::TeamMemberCreated, handler)
    }

    pub fn on_project_created<F>(self, handler: F) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.on_domain(DomainEventKind::ProjectCreated, handler)
    }

    pub fn on_project_deleted<F>(self, handler: F) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.on_domain(DomainEventKind::ProjectDeleted, handler)
    }

    pub fn on_project_updated<F>(self, handler: F) -> Self
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.on_domain(DomainEventKind::ProjectUpdated, handler)
    }

    /// Republish every domain event on `bus` under its event name.
    pub fn forward_to_bus(mut self, bus: &EventBus) -> Self {
        for kind in DomainEventKind::ALL {
            let bus = bus.clone();
            self = self.on_domain(kind, move |event| {
                bus.publish(event.kind.as_str(), &event.payload);
            });
        }
        self
    }
}

impl std::fmt::Debug for WiringHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&'static str> = self.domain.keys().map(|kind| kind.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("WiringHandlers")
            .field("status", &self.status.is_some())
            .field("domain", &kinds)
            .finish()
    }
}

pub(crate) struct WiringInner {
    active: AtomicBool,
    subscriptions: Mutex<Vec<BusSubscription>>,
}

impl WiringInner {
    fn release(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(listeners = subscriptions.len(), "wiring released");
        drop(subscriptions);
        true
    }
}

/// Listeners registered by one [`wire`] call.
///
/// Dropping the handle releases them.
pub struct WiringHandle {
    inner: Arc<WiringInner>,
}

impl WiringHandle {
    /// Remove every listener this wiring added. Calling it again does nothing.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn downgrade(&self) -> Weak<WiringInner> {
        Arc::downgrade(&self.inner)
    }
}

/// Release a wiring through a weak reference, if it is still alive.
pub(crate) fn release_weak(wiring: &Weak<WiringInner>) -> bool {
    wiring.upgrade().is_some_and(|inner| inner.release())
}

impl Drop for WiringHandle {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl std::fmt::Debug for WiringHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiringHandle")
            .field("active", &self.is_active())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Attach `handlers` to `connection`.
///
/// The status callback, when present, is invoked once with the current state
/// before any listener is registered.
pub fn wire(connection: &Connection, handlers: WiringHandlers) -> WiringHandle {
    let mut subscriptions = Vec::new();

    if let Some(status) = handlers.status {
        status(connection.state());
        for (event, state) in [
            (EVENT_CONNECT, ConnectionState::Connected),
            (EVENT_DISCONNECT, ConnectionState::Disconnected),
            (EVENT_CONNECT_ERROR, ConnectionState::Disconnected),
            (EVENT_CONNECTING, ConnectionState::Connecting),
        ] {
            let status = Arc::clone(&status);
            subscriptions.push(connection.on(event, move |_| status(state)));
        }
    }

    subscriptions.push(connection.on(EVENT_RECONNECT_ATTEMPT, |attempt| {
        debug!(%attempt, "reconnect attempt");
    }));
    subscriptions.push(connection.on(EVENT_SERVER_NOTIFY, |payload| {
        info!(%payload, "server notify");
    }));
    subscriptions.push(connection.on(EVENT_HEARTBEAT_REPLY, |payload| {
        debug!(%payload, "heartbeat reply");
    }));

    let mut domain = handlers.domain;
    for kind in DomainEventKind::ALL {
        let callbacks = domain.remove(&kind).unwrap_or_default();
        subscriptions.push(connection.on(kind.as_str(), move |payload| {
            debug!(event = %kind, %payload, "domain event");
            let event = DomainEvent {
                kind,
                payload: payload.clone(),
            };
            for callback in &callbacks {
                callback(&event);
            }
        }));
    }

    WiringHandle {
        inner: Arc::new(WiringInner {
            active: AtomicBool::new(true),
            subscriptions: Mutex::new(subscriptions),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::error::Result;
    use serde_json::json;

    fn connection() -> Result<Connection> {
        Connection::new(
            "http://127.0.0.1:9",
            "/socket.io",
            None,
            ConnectionConfig::default(),
        )
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::clone(&log), log)
    }

    fn snapshot<T: Clone>(log: &Arc<Mutex<Vec<T>>>) -> Vec<T> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[test]
    fn status_callback_gets_current_state_then_changes() -> Result<()> {
        let connection = connection()?;
        let (log, sink) = recorder();
        let _wiring = wire(
            &connection,
            WiringHandlers::new().on_status(move |state| {
                sink.lock().unwrap_or_else(PoisonError::into_inner).push(state);
            }),
        );

        connection.dispatch(EVENT_CONNECT, &json!({"sid": "a"}));
        connection.dispatch(EVENT_RECONNECT_ATTEMPT, &json!(1));
        connection.dispatch(EVENT_CONNECTING, &json!(1));
        connection.dispatch(EVENT_CONNECT_ERROR, &json!({"message": "nope"}));
        connection.dispatch(EVENT_DISCONNECT, &json!("transport close"));

        assert_eq!(
            snapshot(&log),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Disconnected,
            ]
        );
        Ok(())
    }

    #[test]
    fn domain_callbacks_receive_typed_payloads() -> Result<()> {
        let connection = connection()?;
        let (log, sink) = recorder();
        let _wiring = wire(
            &connection,
            WiringHandlers::new().on_team_created(move |event| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.team_member());
            }),
        );

        let delivered = connection.dispatch(
            "team-member:created",
            &json!({"_id": "u1", "name": "Ada", "lastname": "Lovelace", "position": "Engineer"}),
        );
        assert_eq!(delivered, 1);

        let members = snapshot(&log);
        let member = members.first().cloned().flatten().unwrap_or_default();
        assert_eq!(member.id, Some(EntityId::Text("u1".to_string())));
        assert_eq!(member.display_name(), "Ada Lovelace");
        Ok(())
    }

    #[test]
    fn missing_handlers_are_tolerated() -> Result<()> {
        let connection = connection()?;
        let wiring = wire(&connection, WiringHandlers::new());
        assert_eq!(connection.dispatch("project:deleted", &json!({"id": 4})), 1);
        assert_eq!(connection.dispatch(EVENT_CONNECT, &json!({})), 0);
        assert_eq!(wiring.listener_count(), 7);
        Ok(())
    }

    #[test]
    fn release_removes_every_listener_and_is_idempotent() -> Result<()> {
        let connection = connection()?;
        let (log, sink) = recorder();
        let wiring = wire(
            &connection,
            WiringHandlers::new()
                .on_status(|_| {})
                .on_project_updated(move |event| {
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event.payload.clone());
                }),
        );
        assert_eq!(wiring.listener_count(), 11);

        wiring.release();
        wiring.release();
        assert!(!wiring.is_active());
        assert_eq!(wiring.listener_count(), 0);
        for event in [EVENT_CONNECT, EVENT_DISCONNECT, "project:updated", EVENT_SERVER_NOTIFY] {
            assert_eq!(connection.listener_count(event), 0);
        }

        connection.dispatch("project:updated", &json!({"id": 1}));
        assert!(snapshot(&log).is_empty());
        Ok(())
    }

    #[test]
    fn dropping_handle_releases() -> Result<()> {
        let connection = connection()?;
        {
            let _wiring = wire(&connection, WiringHandlers::new());
            assert_eq!(connection.listener_count("project:created"), 1);
        }
        assert_eq!(connection.listener_count("project:created"), 0);
        Ok(())
    }

    #[test]
    fn release_through_weak_reference() -> Result<()> {
        let connection = connection()?;
        let wiring = wire(&connection, WiringHandlers::new());
        let weak = wiring.downgrade();
        assert!(release_weak(&weak));
        assert!(!release_weak(&weak));
        assert!(!wiring.is_active());
        drop(wiring);
        assert!(!release_weak(&weak));
        Ok(())
    }

    #[test]
    fn forward_to_bus_republishes_under_event_name() -> Result<()> {
        let connection = connection()?;
        let bus = EventBus::new();
        let (log, sink) = recorder();
        let _listener = bus.subscribe("project:created", move |detail| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(detail.clone());
        });
        let _wiring = wire(&connection, WiringHandlers::new().forward_to_bus(&bus));

        connection.dispatch("project:created", &json!({"id": "p1", "name": "Apollo"}));
        assert_eq!(snapshot(&log), vec![json!({"id": "p1", "name": "Apollo"})]);
        Ok(())
    }

    #[test]
    fn event_names_round_trip() {
        for kind in DomainEventKind::ALL {
            assert_eq!(DomainEventKind::from_event_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DomainEventKind::from_event_name("team-member:deleted"), None);
    }

    #[test]
    fn summaries_fall_back_to_ids() {
        let event = DomainEvent {
            kind: DomainEventKind::ProjectDeleted,
            payload: json!({"id": 7}),
        };
        assert_eq!(event.summary(), "Project deleted: 7");

        let event = DomainEvent {
            kind: DomainEventKind::TeamMemberCreated,
            payload: json!({"email": "grace@example.com", "position": " Admiral "}),
        };
        assert_eq!(event.summary(), "Team member added: grace@example.com (Admiral)");

        let event = DomainEvent {
            kind: DomainEventKind::ProjectCreated,
            payload: json!("garbage"),
        };
        assert_eq!(event.summary(), "Project created: unknown");
    }
}
