//! Login state and its effect on the realtime connection.

use crate::api::ChatBackend;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::manager::ConnectionManager;
use crate::store::TokenStore;
use crate::wiring::{WiringHandle, WiringHandlers};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Ties the persisted token, the connection manager and the active wiring
/// together.
pub struct SessionController {
    config: ClientConfig,
    manager: ConnectionManager,
    store: Arc<dyn TokenStore>,
    wiring: Mutex<Option<WiringHandle>>,
}

impl SessionController {
    pub fn new(config: ClientConfig, store: Arc<dyn TokenStore>) -> Self {
        let manager = ConnectionManager::new(config.connection.clone());
        Self {
            config,
            manager,
            store,
            wiring: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn token(&self) -> Result<Option<String>> {
        self.store.load_token()
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.token()?.is_some())
    }

    /// Resume a stored session. Returns whether one was found.
    pub async fn bootstrap(&self, handlers: WiringHandlers) -> Result<bool> {
        if self.token()?.is_none() {
            return Ok(false);
        }
        Ok(self.on_logged_in(handlers).await?.is_some())
    }

    /// Authenticate, persist the token and bring the connection up.
    pub async fn login(
        &self,
        backend: &dyn ChatBackend,
        username: &str,
        password: &str,
        handlers: WiringHandlers,
    ) -> Result<Arc<Connection>> {
        let token = backend.login(username, password).await?;
        self.store.persist_token(&token)?;
        info!(username, "logged in");
        self.on_logged_in(handlers)
            .await?
            .ok_or(ClientError::InvalidCredentials)
    }

    /// Apply the stored token to the connection and rewire `handlers`.
    ///
    /// An existing connection is reconnected with the token; otherwise one is
    /// created. Returns `None` when no token is stored.
    pub async fn on_logged_in(&self, handlers: WiringHandlers) -> Result<Option<Arc<Connection>>> {
        let Some(token) = self.token()? else {
            return Ok(None);
        };

        let connection = match self.manager.connection() {
            Ok(connection) => {
                self.manager.update_token(&token).await;
                connection
            }
            Err(ClientError::NotInitialized) => {
                self.manager
                    .connect(&token, &self.config.ws_url, &self.config.ws_path)
                    .await?
            }
            Err(error) => return Err(error),
        };

        self.release_wiring();
        let handle = self.manager.wire(&connection, handlers);
        *self.wiring.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(Some(connection))
    }

    /// Forget the token, detach callbacks and close the connection.
    pub async fn logout(&self) -> Result<()> {
        self.store.clear_token()?;
        self.release_wiring();
        self.manager.disconnect().await;
        info!("logged out");
        Ok(())
    }

    /// The wiring installed by the last `on_logged_in`, if still held.
    pub fn wiring_active(&self) -> bool {
        self.wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(WiringHandle::is_active)
    }

    fn release_wiring(&self) {
        let previous = self
            .wiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.release();
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
