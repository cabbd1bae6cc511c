//! Registry of the model objects (UAVs, beacons, docks, ...) the server
//! tracks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use fleetlink_core::{ResponseBody, Signal};

use super::{find_in_registry, Registry, RegistryError, RegistryEvent};
use crate::object::ModelObject;

/// Registry of tracked objects, indexed by id and by type tag.
///
/// The registry may enforce a size limit; [`ObjectRegistry::add`] refuses
/// new objects with [`RegistryError::Full`] once the limit is reached, and
/// the `added` signal is not fired for the refused object.
pub struct ObjectRegistry {
    inner: Registry<Arc<dyn ModelObject>>,
    by_type: RwLock<HashMap<String, BTreeSet<String>>>,
    size_limit: RwLock<Option<usize>>,
}

impl ObjectRegistry {
    /// Creates a registry without a size limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Registry::new(),
            by_type: RwLock::new(HashMap::new()),
            size_limit: RwLock::new(None),
        }
    }

    /// Returns the configured size limit.
    #[must_use]
    pub fn size_limit(&self) -> Option<usize> {
        *self.size_limit.read()
    }

    /// Sets or clears the size limit. Objects already in the registry stay
    /// even if they exceed a newly lowered limit.
    pub fn set_size_limit(&self, limit: Option<usize>) {
        *self.size_limit.write() = limit;
    }

    /// Registers an object.
    ///
    /// Re-adding the same instance is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::IdTaken`] when the id belongs to a
    /// different instance and with [`RegistryError::Full`] when the size
    /// limit is reached.
    pub fn add(&self, object: Arc<dyn ModelObject>) -> Result<(), RegistryError> {
        let id = object.id().to_owned();
        if let Some(existing) = self.inner.get(&id) {
            if Arc::ptr_eq(&existing, &object) {
                return Ok(());
            }
            return Err(RegistryError::IdTaken(id));
        }
        if let Some(limit) = *self.size_limit.read() {
            if self.inner.len() >= limit {
                return Err(RegistryError::Full);
            }
        }

        let object_type = object.object_type().to_owned();
        self.by_type
            .write()
            .entry(object_type.clone())
            .or_default()
            .insert(id.clone());
        if let Err(error) = self.inner.add(&id, object) {
            if let Some(ids) = self.by_type.write().get_mut(&object_type) {
                ids.remove(&id);
            }
            return Err(error);
        }
        Ok(())
    }

    /// Looks up an object by id; if it is missing, creates it with the
    /// factory and registers it.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Full`] when the object would exceed the
    /// size limit.
    pub fn add_if_missing(
        &self,
        id: &str,
        factory: impl FnOnce(&str) -> Arc<dyn ModelObject>,
    ) -> Result<Arc<dyn ModelObject>, RegistryError> {
        if let Some(existing) = self.inner.get(id) {
            return Ok(existing);
        }
        let object = factory(id);
        self.add(Arc::clone(&object))?;
        Ok(object)
    }

    /// Deregisters the object with the given id; unknown ids are ignored.
    pub fn remove_by_id(&self, id: &str) -> Option<Arc<dyn ModelObject>> {
        let object = self.inner.get(id)?;
        if let Some(ids) = self.by_type.write().get_mut(object.object_type()) {
            ids.remove(id);
        }
        self.inner.remove(id)
    }

    /// Returns the object with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelObject>> {
        self.inner.get(id)
    }

    /// Finds an object by id, recording a structured failure into the
    /// optional response body when it is missing or rejected by the
    /// predicate.
    pub fn find_by_id(
        &self,
        id: &str,
        predicate: Option<&dyn Fn(&Arc<dyn ModelObject>) -> bool>,
        response: Option<&mut ResponseBody>,
        failure_reason: &str,
    ) -> Option<Arc<dyn ModelObject>> {
        find_in_registry(&self.inner, id, predicate, response, failure_reason)
    }

    /// Returns whether an object with the given id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    /// Returns all object ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    /// Returns the ids of the objects with the given type tag, sorted.
    #[must_use]
    pub fn ids_by_type(&self, object_type: &str) -> Vec<String> {
        self.by_type
            .read()
            .get(object_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the ids of the objects whose type tag is in the given list,
    /// sorted.
    #[must_use]
    pub fn ids_by_types(&self, object_types: &[String]) -> Vec<String> {
        let index = self.by_type.read();
        let mut result = BTreeSet::new();
        for object_type in object_types {
            if let Some(ids) = index.get(object_type) {
                result.extend(ids.iter().cloned());
            }
        }
        result.into_iter().collect()
    }

    /// Returns the number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Signal emitted after an object is registered.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<Arc<dyn ModelObject>>> {
        self.inner.added()
    }

    /// Signal emitted after an object is deregistered.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<Arc<dyn ModelObject>>> {
        self.inner.removed()
    }

    /// Signal emitted when the number of objects changes.
    #[must_use]
    pub fn count_changed(&self) -> &Signal<usize> {
        self.inner.count_changed()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("len", &self.len())
            .field("size_limit", &self.size_limit())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::object::Uav;

    use super::*;

    struct Beacon {
        id: String,
    }

    impl ModelObject for Beacon {
        fn id(&self) -> &str {
            &self.id
        }
        fn object_type(&self) -> &str {
            "beacon"
        }
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn make_uav(id: &str) -> Arc<dyn ModelObject> {
        Arc::new(Uav::new(id, "virtual"))
    }

    #[test]
    fn add_and_lookup() {
        let registry = ObjectRegistry::new();
        registry.add(make_uav("DRN-01")).unwrap();

        assert!(registry.contains("DRN-01"));
        assert_eq!(registry.get("DRN-01").unwrap().object_type(), "uav");
        assert_eq!(registry.ids(), vec!["DRN-01"]);
    }

    #[test]
    fn re_adding_same_instance_is_a_no_op() {
        let registry = ObjectRegistry::new();
        let uav = make_uav("DRN-01");
        registry.add(Arc::clone(&uav)).unwrap();
        registry.add(Arc::clone(&uav)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_adding_different_instance_fails() {
        let registry = ObjectRegistry::new();
        registry.add(make_uav("DRN-01")).unwrap();
        assert_eq!(
            registry.add(make_uav("DRN-01")).unwrap_err(),
            RegistryError::IdTaken("DRN-01".to_owned())
        );
    }

    #[test]
    fn size_limit_refuses_add_without_firing_signal() {
        let registry = ObjectRegistry::new();
        registry.set_size_limit(Some(1));

        let added_count = Arc::new(AtomicUsize::new(0));
        let added_clone = Arc::clone(&added_count);
        registry
            .added()
            .connect(move |_| {
                added_clone.fetch_add(1, Ordering::Relaxed);
            })
            .detach();

        registry.add(make_uav("DRN-01")).unwrap();
        assert_eq!(
            registry.add(make_uav("DRN-02")).unwrap_err(),
            RegistryError::Full
        );

        assert_eq!(added_count.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);

        // Removing an object frees a slot.
        registry.remove_by_id("DRN-01");
        registry.add(make_uav("DRN-02")).unwrap();
    }

    #[test]
    fn add_if_missing_creates_only_once() {
        let registry = ObjectRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            registry
                .add_if_missing("DRN-01", move |id| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    make_uav(id)
                })
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn find_by_id_records_failures_in_response() {
        let registry = ObjectRegistry::new();
        registry.add(make_uav("DRN-01")).unwrap();

        let is_uav = |object: &Arc<dyn ModelObject>| object.object_type() == "uav";
        let mut response = ResponseBody::new();
        assert!(registry
            .find_by_id("DRN-01", Some(&is_uav), Some(&mut response), "no such UAV")
            .is_some());
        assert!(response.is_empty());

        assert!(registry
            .find_by_id("GHOST", None, Some(&mut response), "no such UAV")
            .is_none());
        assert_eq!(response.into_value()["error"]["GHOST"], "no such UAV");
    }

    #[test]
    fn type_tag_index_filters_ids() {
        let registry = ObjectRegistry::new();
        registry.add(make_uav("DRN-02")).unwrap();
        registry.add(make_uav("DRN-01")).unwrap();
        registry
            .add(Arc::new(Beacon {
                id: "BCN-01".to_owned(),
            }))
            .unwrap();

        assert_eq!(registry.ids_by_type("uav"), vec!["DRN-01", "DRN-02"]);
        assert_eq!(registry.ids_by_type("beacon"), vec!["BCN-01"]);
        assert!(registry.ids_by_type("dock").is_empty());

        assert_eq!(
            registry.ids_by_types(&["uav".to_owned(), "beacon".to_owned()]),
            vec!["BCN-01", "DRN-01", "DRN-02"]
        );
        assert!(registry.ids_by_types(&[]).is_empty());
    }

    #[test]
    fn remove_cleans_type_index() {
        let registry = ObjectRegistry::new();
        registry.add(make_uav("DRN-01")).unwrap();
        registry.remove_by_id("DRN-01");
        assert!(registry.ids_by_type("uav").is_empty());
        assert!(registry.remove_by_id("DRN-01").is_none());
    }
}
