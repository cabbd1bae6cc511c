//! Registries that keep track of "things" by string identifiers.
//!
//! [`Registry`] is the shared primitive: a keyed store with change signals,
//! sorted iteration and scoped acquisition. The submodules specialize it for
//! channel types, clients, model objects, connections and UAV drivers.

pub mod channel_types;
pub mod clients;
pub mod connections;
pub mod drivers;
pub mod objects;

use std::collections::BTreeMap;

use parking_lot::RwLock;

use fleetlink_core::{ResponseBody, Signal};

pub use channel_types::{ChannelTypeDescriptor, ChannelTypeRegistry};
pub use clients::ClientRegistry;
pub use connections::{ConnectionRegistry, ConnectionRegistryEntry, ConnectionStateEvent};
pub use drivers::UavDriverRegistry;
pub use objects::ObjectRegistry;

/// Errors raised by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("identifier already taken: {0}")]
    IdTaken(String),
    #[error("no such entry: {0}")]
    NoSuchEntry(String),
    #[error("registry is full")]
    Full,
}

/// Payload of the `added` and `removed` signals of a registry.
#[derive(Debug, Clone)]
pub struct RegistryEvent<T> {
    pub id: String,
    pub value: T,
}

/// A keyed store with change signals.
///
/// Entries are held in a sorted map, so [`Registry::ids`] and the other
/// iteration helpers yield deterministic, sorted snapshots. Values are
/// cloned out of the store; registries of shared state store `Arc`s.
pub struct Registry<T: Clone + 'static> {
    entries: RwLock<BTreeMap<String, T>>,
    added: Signal<RegistryEvent<T>>,
    removed: Signal<RegistryEvent<T>>,
    count_changed: Signal<usize>,
}

impl<T: Clone + 'static> Registry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            added: Signal::new(),
            removed: Signal::new(),
            count_changed: Signal::new(),
        }
    }

    /// Signal emitted after an entry is added.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<T>> {
        &self.added
    }

    /// Signal emitted after an entry is removed.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<T>> {
        &self.removed
    }

    /// Signal emitted whenever the number of entries changes.
    #[must_use]
    pub fn count_changed(&self) -> &Signal<usize> {
        &self.count_changed
    }

    /// Adds an entry under the given id.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::IdTaken`] when the id is already used.
    pub fn add(&self, id: &str, value: T) -> Result<(), RegistryError> {
        let count = {
            let mut entries = self.entries.write();
            if entries.contains_key(id) {
                return Err(RegistryError::IdTaken(id.to_owned()));
            }
            entries.insert(id.to_owned(), value.clone());
            entries.len()
        };
        self.added.emit(&RegistryEvent {
            id: id.to_owned(),
            value,
        });
        self.count_changed.emit(&count);
        Ok(())
    }

    /// Removes the entry with the given id, returning it if present.
    pub fn remove(&self, id: &str) -> Option<T> {
        let (value, count) = {
            let mut entries = self.entries.write();
            let value = entries.remove(id)?;
            (value, entries.len())
        };
        self.count_changed.emit(&count);
        self.removed.emit(&RegistryEvent {
            id: id.to_owned(),
            value: value.clone(),
        });
        Some(value)
    }

    /// Returns the entry with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.read().get(id).cloned()
    }

    /// Returns whether the given id is used in this registry.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Returns all ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Returns the ids whose entries match the predicate, sorted.
    #[must_use]
    pub fn ids_matching(&self, predicate: impl Fn(&T) -> bool) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns all values in id order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.entries.read().values().cloned().collect()
    }

    /// Returns all `(id, value)` pairs in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, T)> {
        self.entries
            .read()
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Adds an entry and returns a guard that removes it when dropped.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::IdTaken`] when the id is already used.
    pub fn hold(&self, id: &str, value: T) -> Result<EntryGuard<'_, T>, RegistryError> {
        self.add(id, value)?;
        Ok(EntryGuard {
            registry: self,
            id: id.to_owned(),
        })
    }
}

impl<T: Clone + 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

/// Scoped registry entry: removes the held entry when dropped.
#[must_use = "dropping the guard removes the entry from the registry"]
pub struct EntryGuard<'a, T: Clone + 'static> {
    registry: &'a Registry<T>,
    id: String,
}

impl<T: Clone + 'static> EntryGuard<'_, T> {
    /// The id of the held entry.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T: Clone + 'static> Drop for EntryGuard<'_, T> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Finds an entry by id, recording a structured failure into an optional
/// response body when it is missing or rejected by the predicate.
pub fn find_in_registry<T: Clone + 'static>(
    registry: &Registry<T>,
    id: &str,
    predicate: Option<&dyn Fn(&T) -> bool>,
    response: Option<&mut ResponseBody>,
    failure_reason: &str,
) -> Option<T> {
    let entry = registry
        .get(id)
        .filter(|value| predicate.is_none_or(|predicate| predicate(value)));
    if entry.is_none() {
        if let Some(response) = response {
            response.add_error(id, failure_reason);
        }
    }
    entry
}
