//! Process-wide owner of the realtime connection.

use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::error::{ClientError, Result};
use crate::wiring::{self, WiringHandle, WiringHandlers, WiringInner};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info};

/// Holds at most one [`Connection`] and the wiring attached to it.
///
/// `connect`, `update_token` and `disconnect` are serialized, so concurrent
/// callers never leave two live connections behind.
pub struct ConnectionManager {
    config: ConnectionConfig,
    lifecycle: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<Connection>>>,
    wiring: Mutex<Option<Weak<WiringInner>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
            wiring: Mutex::new(None),
        }
    }

    /// Create a connection authenticated with `token` and start it.
    ///
    /// Any previous connection and its wiring are torn down first. The new
    /// connection is returned immediately in the `connecting` state. An
    /// invalid `url` fails before the current connection is touched.
    pub async fn connect(&self, token: &str, url: &str, path: &str) -> Result<Arc<Connection>> {
        let connection = Arc::new(Connection::new(
            url,
            path,
            non_empty_token(token),
            self.config.clone(),
        )?);

        let _guard = self.lifecycle.lock().await;
        self.release_wiring();
        if let Some(previous) = self.take_current() {
            debug!(url = %previous.url(), "replacing realtime connection");
            previous.stop().await;
        }

        connection.start();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&connection));
        info!(url = %connection.url(), "realtime connection created");
        Ok(connection)
    }

    /// The current connection, or [`ClientError::NotInitialized`] before the
    /// first `connect`.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::NotInitialized)
    }

    /// State of the current connection; `disconnected` when there is none.
    pub fn state(&self) -> ConnectionState {
        self.connection()
            .map_or(ConnectionState::Disconnected, |connection| connection.state())
    }

    /// Reconnect the current connection with `token`. No-op when there is none.
    pub async fn update_token(&self, token: &str) {
        let _guard = self.lifecycle.lock().await;
        let Ok(connection) = self.connection() else {
            debug!("no realtime connection; token update skipped");
            return;
        };
        connection.restart_with_token(non_empty_token(token)).await;
        info!(url = %connection.url(), "realtime token updated");
    }

    /// Attach `handlers` to `connection` and remember the wiring so a later
    /// `disconnect` or `connect` can release it.
    ///
    /// An earlier handle stays active; releasing it is up to its owner.
    pub fn wire(&self, connection: &Connection, handlers: WiringHandlers) -> WiringHandle {
        let handle = wiring::wire(connection, handlers);
        *self.wiring.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.downgrade());
        handle
    }

    /// Release the tracked wiring and tear down the transport.
    ///
    /// The connection object is kept so `update_token` can revive it.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.release_wiring();
        if let Ok(connection) = self.connection() {
            connection.stop().await;
            info!(url = %connection.url(), "realtime disconnected");
        }
    }

    fn release_wiring(&self) {
        let tracked = self
            .wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tracked) = tracked {
            wiring::release_weak(&tracked);
        }
    }

    fn take_current(&self) -> Option<Arc<Connection>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn non_empty_token(token: &str) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
