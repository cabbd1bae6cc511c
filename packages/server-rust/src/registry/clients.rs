//! Registry of the clients currently connected to the server.
//!
//! Clients are indexed both by id and by the type of the communication
//! channel they use, so the hub can fan broadcasts out per channel type
//! without scanning every client.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use fleetlink_core::Signal;

use super::{ChannelTypeRegistry, Registry, RegistryError, RegistryEvent};
use crate::client::Client;

/// Registry of connected clients.
pub struct ClientRegistry {
    inner: Registry<Arc<Client>>,
    channel_types: Arc<ChannelTypeRegistry>,
    /// Secondary index: channel type -> client ids.
    by_channel_type: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Reverse map used to clean the secondary index on removal.
    channel_type_of: RwLock<HashMap<String, String>>,
}

impl ClientRegistry {
    /// Creates a registry that builds channels through the given channel
    /// type registry.
    #[must_use]
    pub fn new(channel_types: Arc<ChannelTypeRegistry>) -> Self {
        Self {
            inner: Registry::new(),
            channel_types,
            by_channel_type: RwLock::new(HashMap::new()),
            channel_type_of: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a client connected over the given channel type, constructing its
    /// channel via the channel type registry.
    ///
    /// Adding an id that is already present returns the existing client; a
    /// client may not connect twice with the same id.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::NoSuchEntry`] when the channel type is
    /// not registered.
    pub fn add(&self, client_id: &str, channel_type: &str) -> Result<Arc<Client>, RegistryError> {
        if let Some(existing) = self.inner.get(client_id) {
            return Ok(existing);
        }

        let channel = self.channel_types.create_channel_for(channel_type)?;
        let client = Arc::new(Client::new(client_id, channel));

        // The secondary index is updated before the entry goes live: the
        // `added` signal triggers the hub's fan-out rebuild, which must
        // already see the new client.
        self.by_channel_type
            .write()
            .entry(channel_type.to_owned())
            .or_default()
            .insert(client_id.to_owned());
        self.channel_type_of
            .write()
            .insert(client_id.to_owned(), channel_type.to_owned());
        if let Err(error) = self.inner.add(client_id, Arc::clone(&client)) {
            if let Some(ids) = self.by_channel_type.write().get_mut(channel_type) {
                ids.remove(client_id);
            }
            self.channel_type_of.write().remove(client_id);
            return Err(error);
        }

        info!(id = %client_id, %channel_type, "client connected");
        Ok(client)
    }

    /// Removes a client; unknown ids are ignored.
    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        let channel_type = self.channel_type_of.write().remove(client_id);
        match channel_type {
            Some(channel_type) => {
                if let Some(ids) = self.by_channel_type.write().get_mut(&channel_type) {
                    ids.remove(client_id);
                }
            }
            None if self.inner.contains(client_id) => {
                warn!(id = %client_id, "no channel type recorded for client");
            }
            None => return None,
        }

        let client = self.inner.remove(client_id);
        if client.is_some() {
            info!(id = %client_id, "client disconnected");
        }
        client
    }

    /// Returns the client with the given id.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.inner.get(client_id)
    }

    /// Returns whether a client with the given id is connected.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.contains(client_id)
    }

    /// Returns all connected client ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    /// Returns the number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the ids of the clients connected over the given channel type.
    #[must_use]
    pub fn client_ids_for_channel_type(&self, channel_type: &str) -> Vec<String> {
        self.by_channel_type
            .read()
            .get(channel_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns whether at least one client is connected over the given
    /// channel type.
    #[must_use]
    pub fn has_clients_for_channel_type(&self, channel_type: &str) -> bool {
        self.by_channel_type
            .read()
            .get(channel_type)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Signal emitted after a client connects.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<Arc<Client>>> {
        self.inner.added()
    }

    /// Signal emitted after a client disconnects.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<Arc<Client>>> {
        self.inner.removed()
    }

    /// Signal emitted when the number of clients changes.
    #[must_use]
    pub fn count_changed(&self) -> &Signal<usize> {
        self.inner.count_changed()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::channel::QueueChannel;
    use crate::registry::channel_types::ChannelTypeDescriptor;

    use super::*;

    fn make_registry() -> ClientRegistry {
        let channel_types = Arc::new(ChannelTypeRegistry::new());
        channel_types.add(ChannelTypeDescriptor::new(
            "tcp",
            Arc::new(|| {
                let (channel, _rx) = QueueChannel::new(4);
                channel
            }),
        ));
        channel_types.add(ChannelTypeDescriptor::new(
            "ws",
            Arc::new(|| {
                let (channel, _rx) = QueueChannel::new(4);
                channel
            }),
        ));
        ClientRegistry::new(channel_types)
    }

    #[test]
    fn add_builds_channel_and_indexes_by_type() {
        let registry = make_registry();
        let client = registry.add("client-1", "tcp").unwrap();
        assert_eq!(client.id(), "client-1");

        assert_eq!(
            registry.client_ids_for_channel_type("tcp"),
            vec!["client-1"]
        );
        assert!(registry.has_clients_for_channel_type("tcp"));
        assert!(!registry.has_clients_for_channel_type("ws"));
    }

    #[test]
    fn add_with_unknown_channel_type_fails() {
        let registry = make_registry();
        assert_eq!(
            registry.add("client-1", "carrier-pigeon").unwrap_err(),
            RegistryError::NoSuchEntry("carrier-pigeon".to_owned())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn adding_same_id_returns_existing_client() {
        let registry = make_registry();
        let first = registry.add("client-1", "tcp").unwrap();
        let second = registry.add("client-1", "ws").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        // The original channel type stays in effect.
        assert_eq!(registry.client_ids_for_channel_type("tcp").len(), 1);
        assert!(registry.client_ids_for_channel_type("ws").is_empty());
    }

    #[test]
    fn remove_cleans_secondary_index() {
        let registry = make_registry();
        registry.add("client-1", "tcp").unwrap();
        registry.add("client-2", "tcp").unwrap();

        assert!(registry.remove("client-1").is_some());
        assert_eq!(
            registry.client_ids_for_channel_type("tcp"),
            vec!["client-2"]
        );

        assert!(registry.remove("client-1").is_none());
    }

    #[test]
    fn signals_fire_on_connect_and_disconnect() {
        let registry = make_registry();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log_added = Arc::clone(&log);
        registry
            .added()
            .connect(move |event| log_added.lock().push(format!("added:{}", event.id)))
            .detach();
        let log_removed = Arc::clone(&log);
        registry
            .removed()
            .connect(move |event| log_removed.lock().push(format!("removed:{}", event.id)))
            .detach();

        registry.add("client-1", "tcp").unwrap();
        registry.remove("client-1");

        assert_eq!(log.lock().clone(), vec!["added:client-1", "removed:client-1"]);
    }

    #[test]
    fn client_ids_for_channel_type_is_sorted() {
        let registry = make_registry();
        registry.add("client-b", "tcp").unwrap();
        registry.add("client-a", "tcp").unwrap();
        assert_eq!(
            registry.client_ids_for_channel_type("tcp"),
            vec!["client-a", "client-b"]
        );
    }
}
