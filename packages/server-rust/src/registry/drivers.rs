//! Registry of the UAV drivers loaded into the server.

use std::sync::Arc;

use fleetlink_core::Signal;

use super::{Registry, RegistryError, RegistryEvent};
use crate::driver::UavDriver;

/// Registry of loaded UAV drivers, keyed by driver id.
///
/// The dispatch layer looks drivers up here when routing multi-target
/// commands, and iterates all of them when a command requests the
/// ignore-ids transport option.
#[derive(Debug, Default)]
pub struct UavDriverRegistry {
    inner: Registry<Arc<dyn UavDriver>>,
}

impl UavDriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under its own id.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::IdTaken`] when a driver with the same id
    /// is already registered.
    pub fn add(&self, driver: Arc<dyn UavDriver>) -> Result<(), RegistryError> {
        let id = driver.id().to_owned();
        self.inner.add(&id, driver)
    }

    /// Deregisters the driver with the given id.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn UavDriver>> {
        self.inner.remove(id)
    }

    /// Returns the driver with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn UavDriver>> {
        self.inner.get(id)
    }

    /// Returns all driver ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    /// Returns all drivers in id order.
    #[must_use]
    pub fn drivers(&self) -> Vec<Arc<dyn UavDriver>> {
        self.inner.values()
    }

    /// Returns the number of registered drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether no drivers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Signal emitted after a driver is registered.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<Arc<dyn UavDriver>>> {
        self.inner.added()
    }

    /// Signal emitted after a driver is deregistered.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<Arc<dyn UavDriver>>> {
        self.inner.removed()
    }
}
