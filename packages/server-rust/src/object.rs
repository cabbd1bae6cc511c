//! Model objects tracked by the server: UAVs, beacons, docking stations.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use fleetlink_core::UavStatusInfo;

/// Type tag of UAV objects in the object registry.
pub const OBJECT_TYPE_UAV: &str = "uav";

/// An object tracked by the object registry.
///
/// Each object carries a unique id and a short type tag (`"uav"`,
/// `"beacon"`, `"dock"`, ...) that `OBJ-LIST` filters match against. The
/// `as_any` hook enables downcasting from `Arc<dyn ModelObject>` to the
/// concrete type, mirroring the type-based lookup of the service registry
/// pattern.
pub trait ModelObject: Send + Sync {
    /// A unique identifier for the object, assigned at construction time.
    fn id(&self) -> &str;

    /// The type tag of the object, as used in `OBJ-LIST` filters.
    fn object_type(&self) -> &str;

    /// Upcast used for downcasting registry entries to concrete types.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A single UAV known to the server.
///
/// Driver-specific state stays inside the driver; the shared model tracks
/// only the identity, the owning driver and the last status snapshot.
pub struct Uav {
    id: String,
    driver_id: String,
    status: RwLock<UavStatusInfo>,
}

impl Uav {
    /// Creates a UAV owned by the driver with the given id.
    #[must_use]
    pub fn new(id: &str, driver_id: &str) -> Self {
        Self {
            id: id.to_owned(),
            driver_id: driver_id.to_owned(),
            status: RwLock::new(UavStatusInfo::new(id)),
        }
    }

    /// The unique identifier of the UAV.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the driver responsible for this UAV.
    #[must_use]
    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Returns a copy of the current status snapshot.
    #[must_use]
    pub fn status(&self) -> UavStatusInfo {
        self.status.read().clone()
    }

    /// Mutates the status snapshot in place.
    ///
    /// Callers are expected to ask the application to emit a rate-limited
    /// `UAV-INF` afterwards; updating the snapshot alone notifies nobody.
    pub fn update_status(&self, f: impl FnOnce(&mut UavStatusInfo)) {
        f(&mut self.status.write());
    }
}

impl ModelObject for Uav {
    fn id(&self) -> &str {
        &self.id
    }

    fn object_type(&self) -> &str {
        OBJECT_TYPE_UAV
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Uav {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uav")
            .field("id", &self.id)
            .field("driver_id", &self.driver_id)
            .finish_non_exhaustive()
    }
}

/// Downcasts a registry entry to a [`Uav`].
#[must_use]
pub fn as_uav(object: Arc<dyn ModelObject>) -> Option<Arc<Uav>> {
    object.as_any().downcast::<Uav>().ok()
}
