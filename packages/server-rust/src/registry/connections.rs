//! Registry of the connections to external data sources managed by the
//! server.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use fleetlink_core::{
    ConnectionInfo, ConnectionPurpose, ConnectionState, Disposer, ResponseBody, Signal,
};

use super::{find_in_registry, Registry, RegistryError, RegistryEvent};
use crate::connection::Connection;

/// Payload of the registry-level `connection_state_changed` signal.
#[derive(Debug, Clone)]
pub struct ConnectionStateEvent {
    pub id: String,
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// A single entry in the connection registry.
pub struct ConnectionRegistryEntry {
    id: String,
    connection: Arc<dyn Connection>,
    purpose: ConnectionPurpose,
    description: Option<String>,
}

impl ConnectionRegistryEntry {
    /// The id of the connection.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The supervised connection itself.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The purpose of the connection.
    #[must_use]
    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    /// The current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Builds the `CONN-INF` status snapshot of this entry.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            purpose: self.purpose,
            status: self.connection.state(),
            description: self.description.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistryEntry")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Registry of supervised connections.
///
/// Every entry re-emits the state changes of its connection through the
/// registry-level [`ConnectionRegistry::connection_state_changed`] signal,
/// which the application funnels into the `CONN-INF` rate limiter.
pub struct ConnectionRegistry {
    inner: Registry<Arc<ConnectionRegistryEntry>>,
    connection_state_changed: Signal<ConnectionStateEvent>,
    hooks: Mutex<HashMap<String, Disposer>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Registry::new(),
            connection_state_changed: Signal::new(),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a connection under the given id.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::IdTaken`] when the id is already used.
    pub fn add(
        &self,
        connection: Arc<dyn Connection>,
        id: &str,
        purpose: ConnectionPurpose,
        description: Option<&str>,
    ) -> Result<Arc<ConnectionRegistryEntry>, RegistryError> {
        let entry = Arc::new(ConnectionRegistryEntry {
            id: id.to_owned(),
            connection: Arc::clone(&connection),
            purpose,
            description: description.map(str::to_owned),
        });

        let signal = self.connection_state_changed.clone();
        let entry_id = id.to_owned();
        let hook = connection.state_changed().connect(move |change| {
            debug!(id = %entry_id, old = ?change.old, new = ?change.new, "connection state changed");
            signal.emit(&ConnectionStateEvent {
                id: entry_id.clone(),
                old: change.old,
                new: change.new,
            });
        });

        self.inner.add(id, Arc::clone(&entry))?;
        self.hooks.lock().insert(id.to_owned(), hook);
        Ok(entry)
    }

    /// Deregisters a connection; unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionRegistryEntry>> {
        if let Some(hook) = self.hooks.lock().remove(id) {
            hook.dispose();
        }
        self.inner.remove(id)
    }

    /// Returns the entry with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ConnectionRegistryEntry>> {
        self.inner.get(id)
    }

    /// Finds an entry by id, recording a structured failure into the
    /// optional response body when it is missing.
    pub fn find_by_id(
        &self,
        id: &str,
        response: Option<&mut ResponseBody>,
        failure_reason: &str,
    ) -> Option<Arc<ConnectionRegistryEntry>> {
        find_in_registry(&self.inner, id, None, response, failure_reason)
    }

    /// Returns whether a connection with the given id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    /// Returns all connection ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    /// Returns all entries in id order.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<ConnectionRegistryEntry>> {
        self.inner.values()
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Signal emitted after a connection is registered.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<Arc<ConnectionRegistryEntry>>> {
        self.inner.added()
    }

    /// Signal emitted after a connection is deregistered.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<Arc<ConnectionRegistryEntry>>> {
        self.inner.removed()
    }

    /// Signal re-emitting the state changes of every registered connection.
    #[must_use]
    pub fn connection_state_changed(&self) -> &Signal<ConnectionStateEvent> {
        &self.connection_state_changed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
