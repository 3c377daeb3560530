//! MCP manager: holds the configured server table and the live connections,
//! and hands out per-server client handles.
//!
//! State is an immutable [`ManagerState`] snapshot swapped as a whole on
//! every change. Connect and disconnect are single-flight per server name.
//! The work runs on spawned tasks, so it completes even if every caller
//! stops waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use conduit_domain::config::{ClientConfig, ClientOptions, ConfigSeverity, ServerDescriptor};

use crate::client::McpClient;
use crate::connection::{
    Connection, ConnectionHooks, ConnectionState, ErrorHook, NotificationHook, ServerNotification,
};
use crate::error::McpError;
use crate::registry::{self, StateHolder};

type ConnectFlight = Shared<BoxFuture<'static, Result<Arc<Connection>, McpError>>>;
type DisconnectFlight = Shared<BoxFuture<'static, Result<(), McpError>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ManagerState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable snapshot of a manager.
///
/// Every change builds a new snapshot; holders of an older one never see it
/// move. The pending-request tables inside each [`Connection`] are the
/// deliberate exception and stay mutable.
#[derive(Debug, Clone)]
pub struct ManagerState {
    configs: Arc<BTreeMap<String, ServerDescriptor>>,
    options: Arc<ClientOptions>,
    connections: BTreeMap<String, Arc<Connection>>,
}

impl ManagerState {
    pub(crate) fn from_config(config: ClientConfig) -> Self {
        Self {
            configs: Arc::new(config.servers),
            options: Arc::new(config.options),
            connections: BTreeMap::new(),
        }
    }

    pub fn configs(&self) -> &BTreeMap<String, ServerDescriptor> {
        &self.configs
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn connection(&self, server: &str) -> Option<&Arc<Connection>> {
        self.connections.get(server)
    }

    pub fn active_servers(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub(crate) fn with_connection(&self, server: &str, conn: Arc<Connection>) -> Self {
        let mut next = self.clone();
        next.connections.insert(server.to_string(), conn);
        next
    }

    pub(crate) fn without_connection(&self, server: &str) -> Self {
        let mut next = self.clone();
        next.connections.remove(server);
        next
    }

    fn without_connections(&self) -> Self {
        Self {
            configs: Arc::clone(&self.configs),
            options: Arc::clone(&self.options),
            connections: BTreeMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ManagerInner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ManagerInner {
    id: Uuid,
    state: RwLock<Arc<ManagerState>>,
    connecting: Mutex<HashMap<String, ConnectFlight>>,
    disconnecting: Mutex<HashMap<String, DisconnectFlight>>,
    hooks: ConnectionHooks,
}

impl StateHolder for ManagerInner {
    fn manager_id(&self) -> Uuid {
        self.id
    }

    fn snapshot(&self) -> Arc<ManagerState> {
        self.state.read().clone()
    }

    fn replace(&self, expected: &Arc<ManagerState>, next: Arc<ManagerState>) -> bool {
        let mut current = self.state.write();
        if !Arc::ptr_eq(&current, expected) {
            return false;
        }
        *current = next;
        true
    }
}

impl ManagerInner {
    /// Apply `f` to the current snapshot and install the result.
    fn update(&self, f: impl Fn(&ManagerState) -> ManagerState) {
        let mut current = self.state.write();
        *current = Arc::new(f(&current));
    }

    fn install(self: &Arc<Self>, server: &str, conn: &Arc<Connection>) {
        self.update(|s| s.with_connection(server, Arc::clone(conn)));
        let holder: Arc<dyn StateHolder> = self.clone();
        registry::register(server, &holder);
        self.watch(server.to_string(), conn);
    }

    /// Remove `server` only if it still maps to `conn`.
    fn remove_if_current(&self, server: &str, conn: &Arc<Connection>) -> bool {
        let mut current = self.state.write();
        let is_current = current
            .connection(server)
            .is_some_and(|existing| Arc::ptr_eq(existing, conn));
        if is_current {
            *current = Arc::new(current.without_connection(server));
        }
        is_current
    }

    fn take_connection(&self, server: &str) -> Option<Arc<Connection>> {
        let mut current = self.state.write();
        let conn = current.connection(server).cloned()?;
        *current = Arc::new(current.without_connection(server));
        Some(conn)
    }

    /// React to a connection closing on its own.
    ///
    /// Holds only weak references, so dropping the last manager handle
    /// drops the connection and stops its server.
    fn watch(self: &Arc<Self>, server: String, conn: &Arc<Connection>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let weak_conn = Arc::downgrade(conn);
        let mut state = conn.watch_state();
        tokio::spawn(async move {
            if state.wait_for(|s| *s == ConnectionState::Closed).await.is_err() {
                return;
            }
            let Some(conn) = weak_conn.upgrade() else {
                return;
            };
            if conn.is_intentional() {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };

            let error = conn
                .close_reason()
                .unwrap_or_else(|| McpError::Disconnected(server.clone()));
            match &manager.hooks.on_error {
                Some(hook) => hook(&server, &error),
                None => tracing::error!(server = %server, error = %error, "MCP server disconnected unexpectedly"),
            }

            if manager.remove_if_current(&server, &conn) {
                registry::unregister(&server, manager.id);
                evict(registry::propagate_disconnect(&server));
            }
        });
    }

    /// Settle any connect in flight for `server`, then tear down what it
    /// left. Propagation only happens for a connection this manager held.
    async fn teardown(self: Arc<Self>, server: String) -> Result<(), McpError> {
        let connecting = self.connecting.lock().get(&server).cloned();
        if let Some(flight) = connecting {
            let _ = flight.await;
        }

        let Some(conn) = self.take_connection(&server) else {
            return Ok(());
        };
        registry::unregister(&server, self.id);
        evict(registry::propagate_disconnect(&server));

        tracing::info!(server = %server, "disconnecting MCP server");
        conn.shutdown().await
    }
}

/// Close connections evicted from other managers.
fn evict(connections: Vec<Arc<Connection>>) {
    for conn in connections {
        tokio::spawn(async move {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(server = %conn.server(), error = %e, "error closing evicted MCP connection");
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to one manager instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct McpManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for McpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpManager")
            .field("id", &self.inner.id)
            .field("active", &self.active_servers())
            .finish()
    }
}

/// Builder for [`McpManager`] with optional hooks.
pub struct ManagerBuilder {
    config: ClientConfig,
    hooks: ConnectionHooks,
}

impl ManagerBuilder {
    /// Receive server notifications (log messages included) instead of
    /// having them logged.
    pub fn on_notification(mut self, hook: impl Fn(ServerNotification) + Send + Sync + 'static) -> Self {
        let hook: NotificationHook = Arc::new(hook);
        self.hooks.on_notification = Some(hook);
        self
    }

    /// Receive unexpected disconnects instead of having them logged.
    pub fn on_error(mut self, hook: impl Fn(&str, &McpError) + Send + Sync + 'static) -> Self {
        let hook: ErrorHook = Arc::new(hook);
        self.hooks.on_error = Some(hook);
        self
    }

    pub fn build(self) -> McpManager {
        for issue in self.config.validate() {
            match issue.severity {
                ConfigSeverity::Error => tracing::error!(%issue, "MCP config issue"),
                ConfigSeverity::Warning => tracing::warn!(%issue, "MCP config issue"),
            }
        }

        let inner = ManagerInner {
            id: Uuid::new_v4(),
            state: RwLock::new(Arc::new(ManagerState::from_config(self.config))),
            connecting: Mutex::new(HashMap::new()),
            disconnecting: Mutex::new(HashMap::new()),
            hooks: self.hooks,
        };
        tracing::debug!(manager_id = %inner.id, servers = inner.state.read().configs.len(), "MCP manager created");
        McpManager {
            inner: Arc::new(inner),
        }
    }
}

impl McpManager {
    /// Create a manager. The config is copied; later edits to the caller's
    /// value are not observed.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            hooks: ConnectionHooks::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Connect to `server` (or reuse the live connection) and return this
    /// manager for chaining.
    pub async fn use_server(&self, server: &str) -> Result<McpManager, McpError> {
        self.connect(server).await?;
        Ok(self.clone())
    }

    /// Connect to `server` and return its live connection.
    ///
    /// Concurrent calls for one name share a single attempt. A disconnect in
    /// flight for that name is awaited first.
    pub async fn connect(&self, server: &str) -> Result<Arc<Connection>, McpError> {
        loop {
            let draining = self.inner.disconnecting.lock().get(server).cloned();
            if let Some(draining) = draining {
                let _ = draining.await;
                continue;
            }

            if let Some(conn) = self.live_connection(server) {
                return Ok(conn);
            }

            let flight = {
                let mut connecting = self.inner.connecting.lock();
                match connecting.get(server) {
                    Some(flight) => flight.clone(),
                    None => {
                        let flight = self.start_connect(server)?;
                        connecting.insert(server.to_string(), flight.clone());
                        flight
                    }
                }
            };
            return flight.await;
        }
    }

    fn start_connect(&self, server: &str) -> Result<ConnectFlight, McpError> {
        let snapshot = self.snapshot();
        let descriptor = snapshot
            .configs
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::Configuration(server.to_string()))?;
        let options = Arc::clone(&snapshot.options);

        tracing::info!(server = %server, transport = %descriptor.kind(), target = %descriptor.target(), "connecting to MCP server");

        let inner = Arc::clone(&self.inner);
        let name = server.to_string();
        let task = tokio::spawn(async move {
            let result = Connection::open(&name, descriptor, options, inner.hooks.clone()).await;
            if let Ok(conn) = &result {
                inner.install(&name, conn);
            }
            inner.connecting.lock().remove(&name);
            result
        });

        Ok(async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(McpError::Protocol(format!("connect task failed: {e}"))),
            }
        }
        .boxed()
        .shared())
    }

    fn live_connection(&self, server: &str) -> Option<Arc<Connection>> {
        self.snapshot()
            .connection(server)
            .filter(|c| c.state() == ConnectionState::Ready)
            .cloned()
    }

    /// Client handle for a connected server, from the current snapshot only.
    pub fn get_client(&self, server: &str) -> Option<McpClient> {
        self.live_connection(server)
            .map(|conn| McpClient::new(server, conn, self.clone()))
    }

    /// Like [`get_client`](Self::get_client), but first waits for a connect
    /// already in flight for `server`. Never starts one.
    pub async fn get_client_async(&self, server: &str) -> Option<McpClient> {
        let flight = self.inner.connecting.lock().get(server).cloned();
        if let Some(flight) = flight {
            let _ = flight.await;
        }
        self.get_client(server)
    }

    /// Disconnect `server`. Concurrent calls share one teardown; a connect
    /// in flight is awaited and then torn down. A server that is not
    /// connected is a no-op.
    pub async fn disconnect(&self, server: &str) -> Result<(), McpError> {
        let flight = {
            let mut disconnecting = self.inner.disconnecting.lock();
            match disconnecting.get(server) {
                Some(flight) => flight.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let name = server.to_string();
                    let task = tokio::spawn(async move {
                        let result = Arc::clone(&inner).teardown(name.clone()).await;
                        inner.disconnecting.lock().remove(&name);
                        result
                    });
                    let flight = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(McpError::Protocol(format!("disconnect task failed: {e}"))),
                        }
                    }
                    .boxed()
                    .shared();
                    disconnecting.insert(server.to_string(), flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Disconnect every active server. Failures are collected rather than
    /// stopping early, and the connection table is empty afterwards.
    pub async fn disconnect_all(&self) -> Result<(), McpError> {
        let servers = self.active_servers();
        let outcomes = futures_util::future::join_all(servers.iter().map(|server| async move {
            (server.clone(), self.disconnect(server).await)
        }))
        .await;

        self.inner.update(ManagerState::without_connections);

        let failures: Vec<(String, McpError)> = outcomes
            .into_iter()
            .filter_map(|(server, outcome)| outcome.err().map(|e| (server, e)))
            .collect();
        if failures.is_empty() {
            tracing::debug!(count = servers.len(), "disconnected all MCP servers");
            Ok(())
        } else {
            Err(McpError::DisconnectAll(failures))
        }
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> Arc<ManagerState> {
        self.inner.snapshot()
    }

    pub fn active_servers(&self) -> Vec<String> {
        self.snapshot().active_servers()
    }

    /// Every configured server name.
    pub fn server_names(&self) -> Vec<String> {
        self.snapshot().configs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_server_is_a_configuration_error() {
        let manager = McpManager::new(ClientConfig::default());
        let err = manager.use_server("nope").await.unwrap_err();
        assert!(matches!(err, McpError::Configuration(ref name) if name == "nope"));
        assert!(manager.get_client("nope").is_none());
    }

    #[tokio::test]
    async fn disconnect_of_inactive_server_is_noop() {
        let manager = McpManager::new(ClientConfig::default());
        manager.disconnect("idle").await.unwrap();
        manager.disconnect_all().await.unwrap();
        assert!(manager.active_servers().is_empty());
    }

    #[test]
    fn config_is_copied() {
        let mut config = ClientConfig::default()
            .with_server("a", ServerDescriptor::process("true", Vec::<String>::new()));
        let manager = McpManager::new(config.clone());
        config.servers.clear();
        assert_eq!(manager.server_names(), vec!["a".to_string()]);
    }

    #[test]
    fn snapshots_are_not_mutated_in_place() {
        let manager = McpManager::new(ClientConfig::default());
        let before = manager.snapshot();
        manager.inner.update(ManagerState::without_connections);
        let after = manager.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn failed_connect_is_not_registered() {
        let config = ClientConfig::default()
            .with_server("broken", ServerDescriptor::process("/no/such/binary", Vec::<String>::new()));
        let manager = McpManager::new(config);
        let err = manager.use_server("broken").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Spawn);
        assert!(manager.active_servers().is_empty());
        assert!(registry::registered_managers("broken").is_empty());
    }
}
