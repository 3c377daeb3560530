//! Process-wide disconnect registry.
//!
//! Maps a server name to every manager instance holding a live connection
//! under that name. Disconnecting a server through one manager removes it
//! from all of them. This is the only shared mutable state between
//! managers and is used for nothing else.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::Connection;
use crate::manager::ManagerState;

/// Read/replace access to one manager's state snapshot.
pub(crate) trait StateHolder: Send + Sync {
    fn manager_id(&self) -> Uuid;

    fn snapshot(&self) -> Arc<ManagerState>;

    /// Install `next` if the current snapshot is still `expected`.
    fn replace(&self, expected: &Arc<ManagerState>, next: Arc<ManagerState>) -> bool;
}

struct Entry {
    manager_id: Uuid,
    holder: Weak<dyn StateHolder>,
}

type Table = Mutex<HashMap<String, Vec<Entry>>>;

fn table() -> &'static Table {
    static REGISTRY: OnceLock<Table> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record that `holder` has a live connection to `server`.
pub(crate) fn register(server: &str, holder: &Arc<dyn StateHolder>) {
    let manager_id = holder.manager_id();
    let mut table = table().lock();
    let entries = table.entry(server.to_string()).or_default();
    entries.retain(|e| e.holder.strong_count() > 0);
    if entries.iter().any(|e| e.manager_id == manager_id) {
        return;
    }
    entries.push(Entry {
        manager_id,
        holder: Arc::downgrade(holder),
    });
    tracing::trace!(server, %manager_id, managers = entries.len(), "registered MCP connection");
}

pub(crate) fn unregister(server: &str, manager_id: Uuid) {
    let mut table = table().lock();
    if let Some(entries) = table.get_mut(server) {
        entries.retain(|e| e.manager_id != manager_id);
        if entries.is_empty() {
            table.remove(server);
        }
    }
}

/// Remove `server` from every registered manager's snapshot.
///
/// Returns the connections evicted from those managers; the caller decides
/// how to close them.
pub(crate) fn propagate_disconnect(server: &str) -> Vec<Arc<Connection>> {
    let entries = table().lock().remove(server).unwrap_or_default();

    let mut evicted = Vec::new();
    for entry in entries {
        let Some(holder) = entry.holder.upgrade() else {
            continue;
        };
        loop {
            let snapshot = holder.snapshot();
            let Some(conn) = snapshot.connection(server).cloned() else {
                break;
            };
            if holder.replace(&snapshot, Arc::new(snapshot.without_connection(server))) {
                tracing::debug!(server, manager_id = %entry.manager_id, "propagated MCP disconnect");
                evicted.push(conn);
                break;
            }
        }
    }
    evicted
}

/// Managers currently registered under `server`.
#[cfg(test)]
pub(crate) fn registered_managers(server: &str) -> Vec<Uuid> {
    table()
        .lock()
        .get(server)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| e.holder.strong_count() > 0)
                .map(|e| e.manager_id)
                .collect()
        })
        .unwrap_or_default()
}
