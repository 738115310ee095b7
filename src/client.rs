//! Device Client
//!
//! Owns the connection manager and the state every [`Handle`] shares: the
//! handle registry, the call registry, the outbox and the cached credential.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shelly_rpc::{Client, ClientConfig, Request};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::connect(&ClientConfig::new("192.168.33.1").with_password("secret"))?;
//! let handle = client.new_handle("Shelly").await;
//!
//! let raw = handle
//!     .send(&CancellationToken::new(), &Request::new("Shelly.GetDeviceInfo"))
//!     .await?;
//!
//! client.close().await;
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AuthCredential;
use crate::component::{Component, ComponentClient, MessageHandler, MessageHandlerFactory};
use crate::config::ClientConfig;
use crate::connection::{self, ConnectionState};
use crate::error::Result;
use crate::handle::{CallRegistry, Handle, HandleInner};

/// Frames queued for the egress writer.
const OUTBOX_CAPACITY: usize = 50;

struct RegistryEntry {
    name: String,
    done: CancellationToken,
    handle: Weak<HandleInner>,
}

/// Live handles by id. Entries hold weak references so dropped handles don't leak.
#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, RegistryEntry>,
}

impl Registry {
    fn find(&self, name: &str) -> Option<Handle> {
        self.entries
            .values()
            .filter(|entry| entry.name == name && !entry.done.is_cancelled())
            .find_map(|entry| entry.handle.upgrade())
            .map(Handle::from_inner)
    }

    fn prune(&mut self) {
        self.entries
            .retain(|_, entry| entry.handle.strong_count() > 0 && !entry.done.is_cancelled());
    }
}

/// State shared between the client, its handles and the connection manager.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub calls: Arc<CallRegistry>,
    pub outbox: mpsc::Sender<String>,
    pub shutdown: CancellationToken,
    registry: RwLock<Registry>,
    credential: RwLock<Option<AuthCredential>>,
    next_call_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    pub fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn credential(&self) -> Option<AuthCredential> {
        self.credential.read().await.clone()
    }

    pub async fn set_credential(&self, credential: AuthCredential) {
        *self.credential.write().await = Some(credential);
    }

    /// Forget the cached credential; true if one was set.
    pub async fn clear_credential(&self) -> bool {
        self.credential.write().await.take().is_some()
    }

    /// Forget `credential` unless another call has already replaced it.
    pub async fn clear_credential_if(&self, credential: &AuthCredential) {
        let mut cached = self.credential.write().await;
        if cached.as_ref() == Some(credential) {
            *cached = None;
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    pub async fn unregister(&self, id: u64) {
        if let Some(entry) = self.registry.write().await.entries.remove(&id) {
            debug!(handle = %entry.name, id = id, "Unregistered handle");
        }
    }
}

/// Client for one Shelly Gen2 device.
///
/// Dropping the client stops the connection manager; [`Client::close`]
/// additionally waits for it to finish.
pub struct Client {
    shared: Arc<Shared>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client for the device in `config`.
    ///
    /// Returns immediately; the connection is dialed in the background and
    /// requests queue until it is up. Must be called inside a Tokio runtime.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;

        if config.password.is_none() {
            debug!("No password configured; requests to a device with auth enabled will fail");
        }

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        info!(
            hostname = %config.hostname,
            username = %config.username,
            send_timeout_ms = config.send_timeout_ms,
            send_trys = config.send_trys,
            "Starting device client"
        );

        let shared = Arc::new(Shared {
            config,
            calls: Arc::new(CallRegistry::default()),
            outbox: outbox_tx,
            shutdown: CancellationToken::new(),
            registry: RwLock::new(Registry::default()),
            credential: RwLock::new(None),
            next_call_id: AtomicU64::new(1),
            state: state_tx,
        });

        let manager = tokio::spawn(connection::run(Arc::clone(&shared), outbox_rx));

        Ok(Self {
            shared,
            manager: Mutex::new(Some(manager)),
        })
    }

    /// Handle for component `name`.
    ///
    /// Asking twice for the same name returns the same live handle.
    pub async fn new_handle(&self, name: &str) -> Handle {
        let mut registry = self.shared.registry.write().await;

        if let Some(handle) = registry.find(name) {
            return handle;
        }

        registry.prune();
        registry.next_id += 1;
        let id = registry.next_id;

        let handle = Handle::new(id, name, Arc::clone(&self.shared));
        registry.entries.insert(
            id,
            RegistryEntry {
                name: name.to_string(),
                done: handle.done_token(),
                handle: handle.downgrade(),
            },
        );

        debug!(handle = %name, id = id, "Registered handle");
        handle
    }

    /// Typed client for one of the device's components.
    pub async fn component(&self, component: Component) -> ComponentClient {
        let handle = self.new_handle(component.as_str()).await;
        ComponentClient::new(component.as_str(), Arc::new(handle))
    }

    /// True once a credential has been computed for the current connection.
    pub async fn is_auth_enabled(&self) -> bool {
        self.shared.credential.read().await.is_some()
    }

    /// Watch the connection manager's state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Number of live handles.
    pub async fn handle_count(&self) -> usize {
        let mut registry = self.shared.registry.write().await;
        registry.prune();
        registry.entries.len()
    }

    /// Close every handle and stop the connection manager.
    ///
    /// Blocked sends return [`crate::RpcError::Closed`]. Idempotent.
    pub async fn close(&self) {
        let entries: Vec<RegistryEntry> = {
            let mut registry = self.shared.registry.write().await;
            registry.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.done.cancel();
            debug!(handle = %entry.name, "Closed handle");
        }

        self.shared.shutdown.cancel();

        let manager = self.manager.lock().await.take();
        if let Some(manager) = manager {
            if let Err(e) = manager.await {
                error!(error = %e, "Connection manager panicked");
            }
            info!(hostname = %self.shared.config.hostname, "Device client closed");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl MessageHandlerFactory for Client {
    async fn new_handle(&self, name: &str) -> Arc<dyn MessageHandler> {
        Arc::new(Client::new_handle(self, name).await)
    }

    async fn is_auth_enabled(&self) -> bool {
        Client::is_auth_enabled(self).await
    }

    async fn close(&self) {
        Client::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    fn unreachable_config() -> ClientConfig {
        // Reserved TEST-NET address; dials never succeed
        ClientConfig {
            send_timeout_ms: 50,
            retry_wait_ms: 50,
            ..ClientConfig::new("192.0.2.1:9")
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_hostname() {
        let result = Client::connect(&ClientConfig::default());
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_handle_reuses_name() {
        let client = Client::connect(&unreachable_config()).unwrap();

        let first = client.new_handle("Switch").await;
        let again = client.new_handle("Switch").await;
        let other = client.new_handle("Light").await;

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other.id());
        assert_eq!(client.handle_count().await, 2);

        client.close().await;
    }

    #[tokio::test]
    async fn test_closed_handle_is_replaced() {
        let client = Client::connect(&unreachable_config()).unwrap();

        let first = client.new_handle("Sys").await;
        first.close().await;
        assert!(first.is_closed());

        let second = client.new_handle("Sys").await;
        assert_ne!(first.id(), second.id());
        assert!(!second.is_closed());

        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = Client::connect(&unreachable_config()).unwrap();
        let handle = client.new_handle("Shelly").await;

        client.close().await;
        client.close().await;

        assert!(handle.is_closed());
        assert_eq!(*client.state().borrow(), ConnectionState::Closed);
        assert_eq!(client.handle_count().await, 0);
    }

    #[tokio::test]
    async fn test_credential_cache() {
        let client = Client::connect(&unreachable_config()).unwrap();
        assert!(!client.is_auth_enabled().await);

        let credential = AuthCredential {
            realm: "dev".into(),
            username: "admin".into(),
            nonce: 1,
            cnonce: 2,
            response: "abc".into(),
            algorithm: "SHA-256".into(),
        };
        client.shared.set_credential(credential.clone()).await;
        assert!(client.is_auth_enabled().await);

        let mut other = credential.clone();
        other.nonce = 9;
        client.shared.clear_credential_if(&other).await;
        assert!(client.is_auth_enabled().await);

        client.shared.clear_credential_if(&credential).await;
        assert!(!client.is_auth_enabled().await);

        client.close().await;
    }
}
