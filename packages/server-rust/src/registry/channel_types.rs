//! Catalog of the communication channel *types* the server can speak.
//!
//! Each transport (TCP, WebSocket, Unix socket, ...) registers a descriptor
//! with a factory for per-client channels, an optional broadcaster used for
//! efficient fan-out, and an optional SSDP locator that advertises where the
//! channel can be reached. Individual client channels are tracked by the
//! client registry, not here.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use fleetlink_core::{Envelope, Signal};

use super::{Registry, RegistryError, RegistryEvent};
use crate::channel::CommunicationChannel;

/// Constructs a fresh channel for one client of this type.
pub type ChannelFactory = Arc<dyn Fn() -> Arc<dyn CommunicationChannel> + Send + Sync>;

/// Sends one message to every connected client of this channel type.
pub type Broadcaster = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Derives the URI where this channel type is reachable, given an optional
/// interested peer.
pub type SsdpLocator = Arc<dyn Fn(Option<SocketAddr>) -> Option<String> + Send + Sync>;

/// Immutable description of one communication channel type.
#[derive(Clone)]
pub struct ChannelTypeDescriptor {
    pub id: String,
    pub factory: ChannelFactory,
    /// Broadcast fan-out; `None` makes the hub fall back to per-client
    /// sends.
    pub broadcaster: Option<Broadcaster>,
    pub ssdp_location: Option<SsdpLocator>,
}

impl ChannelTypeDescriptor {
    /// Creates a descriptor with a factory only.
    #[must_use]
    pub fn new(id: &str, factory: ChannelFactory) -> Self {
        Self {
            id: id.to_owned(),
            factory,
            broadcaster: None,
            ssdp_location: None,
        }
    }

    /// Attaches a broadcaster to the descriptor.
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Attaches an SSDP locator to the descriptor.
    #[must_use]
    pub fn with_ssdp_location(mut self, locator: SsdpLocator) -> Self {
        self.ssdp_location = Some(locator);
        self
    }

    /// Returns the URI where this channel type can be reached from the
    /// given peer, if the transport can tell.
    #[must_use]
    pub fn get_ssdp_location(&self, peer: Option<SocketAddr>) -> Option<String> {
        self.ssdp_location.as_ref().and_then(|locator| locator(peer))
    }
}

impl std::fmt::Debug for ChannelTypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTypeDescriptor")
            .field("id", &self.id)
            .field("has_broadcaster", &self.broadcaster.is_some())
            .finish_non_exhaustive()
    }
}

/// Registry of channel type descriptors.
#[derive(Debug, Default)]
pub struct ChannelTypeRegistry {
    inner: Registry<ChannelTypeDescriptor>,
}

impl ChannelTypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel type; adding an id that is already registered is
    /// a no-op.
    pub fn add(&self, descriptor: ChannelTypeDescriptor) {
        let id = descriptor.id.clone();
        if self.inner.add(&id, descriptor).is_ok() {
            debug!(%id, "channel type registered");
        }
    }

    /// Deregisters a channel type; unknown ids are ignored.
    ///
    /// The behaviour of the server is undefined while clients still use a
    /// channel of this type.
    pub fn remove(&self, id: &str) {
        if self.inner.remove(id).is_some() {
            debug!(%id, "channel type deregistered");
        }
    }

    /// Creates a new communication channel of the given type.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::NoSuchEntry`] for unknown channel types.
    pub fn create_channel_for(
        &self,
        id: &str,
    ) -> Result<Arc<dyn CommunicationChannel>, RegistryError> {
        let descriptor = self
            .inner
            .get(id)
            .ok_or_else(|| RegistryError::NoSuchEntry(id.to_owned()))?;
        Ok((descriptor.factory)())
    }

    /// Returns the descriptor of the given channel type.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ChannelTypeDescriptor> {
        self.inner.get(id)
    }

    /// Returns all registered channel type ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }

    /// Returns all descriptors in id order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ChannelTypeDescriptor> {
        self.inner.values()
    }

    /// Returns the number of registered channel types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether no channel types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Signal emitted after a channel type is registered.
    #[must_use]
    pub fn added(&self) -> &Signal<RegistryEvent<ChannelTypeDescriptor>> {
        self.inner.added()
    }

    /// Signal emitted after a channel type is deregistered.
    #[must_use]
    pub fn removed(&self) -> &Signal<RegistryEvent<ChannelTypeDescriptor>> {
        self.inner.removed()
    }

    /// Signal emitted when the number of channel types changes.
    #[must_use]
    pub fn count_changed(&self) -> &Signal<usize> {
        self.inner.count_changed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::channel::QueueChannel;

    use super::*;

    fn queue_factory() -> ChannelFactory {
        Arc::new(|| {
            let (channel, _rx) = QueueChannel::new(4);
            channel
        })
    }

    #[test]
    fn add_and_create_channel() {
        let registry = ChannelTypeRegistry::new();
        registry.add(ChannelTypeDescriptor::new("tcp", queue_factory()));

        assert_eq!(registry.ids(), vec!["tcp"]);
        let _channel = registry.create_channel_for("tcp").unwrap();
    }

    #[test]
    fn create_channel_for_unknown_type_fails() {
        let registry = ChannelTypeRegistry::new();
        assert_eq!(
            registry.create_channel_for("nope").unwrap_err(),
            RegistryError::NoSuchEntry("nope".to_owned())
        );
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let registry = ChannelTypeRegistry::new();
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let calls = Arc::clone(&factory_calls);
        registry.add(ChannelTypeDescriptor::new(
            "tcp",
            Arc::new(move || {
                calls.fetch_add(1, Ordering::Relaxed);
                let (channel, _rx) = QueueChannel::new(4);
                channel
            }),
        ));
        registry.add(ChannelTypeDescriptor::new("tcp", queue_factory()));

        // The first factory stays in place.
        let _ = registry.create_channel_for("tcp").unwrap();
        assert_eq!(factory_calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn signals_fire_on_add_and_remove() {
        let registry = ChannelTypeRegistry::new();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let events_added = Arc::clone(&events);
        registry
            .added()
            .connect(move |event| events_added.lock().push(format!("added:{}", event.id)))
            .detach();
        let events_removed = Arc::clone(&events);
        registry
            .removed()
            .connect(move |event| events_removed.lock().push(format!("removed:{}", event.id)))
            .detach();

        registry.add(ChannelTypeDescriptor::new("ws", queue_factory()));
        registry.remove("ws");
        registry.remove("ws");

        assert_eq!(events.lock().clone(), vec!["added:ws", "removed:ws"]);
    }

    #[test]
    fn ssdp_location_is_forwarded() {
        let descriptor = ChannelTypeDescriptor::new("tcp", queue_factory())
            .with_ssdp_location(Arc::new(|peer| {
                peer.map(|addr| format!("tcp://{addr}"))
            }));

        assert_eq!(descriptor.get_ssdp_location(None), None);
        let addr: SocketAddr = "192.168.1.17:1234".parse().unwrap();
        assert_eq!(
            descriptor.get_ssdp_location(Some(addr)),
            Some("tcp://192.168.1.17:1234".to_owned())
        );
    }
}
