//! Client subscriptions to the device tree and the `DEV-INF` notification
//! flow.
//!
//! The manager owns the device tree. Mutator sessions run through
//! [`DeviceTreeSubscriptionManager::mutate`]: after a session commits, the
//! manager walks the ancestor chains of the changed channel nodes, takes a
//! channel-value snapshot for every affected node that has subscribers, and
//! enqueues exactly one `DEV-INF` notification per affected subscriber with
//! the union of the paths that subscriber watches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use fleetlink_core::{DeviceTree, NodeId, ResponseBody, TreeError, TreeMutator};

use crate::hub::MessageHub;

/// Manages device-tree subscriptions and publishes change notifications.
pub struct DeviceTreeSubscriptionManager {
    tree: RwLock<DeviceTree>,
    hub: Arc<MessageHub>,
}

impl DeviceTreeSubscriptionManager {
    /// Creates a manager over an empty tree, publishing through the given
    /// hub.
    #[must_use]
    pub fn new(hub: Arc<MessageHub>) -> Self {
        Self {
            tree: RwLock::new(DeviceTree::new()),
            hub,
        }
    }

    /// Runs a read-only closure against the tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&DeviceTree) -> R) -> R {
        f(&self.tree.read())
    }

    /// Runs a structural mutation (adding objects, devices, channels)
    /// against the tree.
    ///
    /// Channel *values* must be changed through
    /// [`DeviceTreeSubscriptionManager::mutate`] instead so that
    /// subscribers get notified.
    pub fn with_tree_mut<R>(&self, f: impl FnOnce(&mut DeviceTree) -> R) -> R {
        f(&mut self.tree.write())
    }

    /// Runs a mutator session and notifies the affected subscribers.
    ///
    /// Within one commit, each affected subscriber receives exactly one
    /// `DEV-INF` whose `values` map covers every subscribed ancestor of the
    /// channels that actually changed.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut TreeMutator<'_>) -> R) -> R {
        let (result, batches) = {
            let mut tree = self.tree.write();
            let (result, changed) = tree.mutate(f);
            let batches = subscriber_batches(&tree, &changed);
            (result, batches)
        };

        for (subscriber, values) in batches {
            let body = serde_json::json!({ "type": "DEV-INF", "values": values });
            let message = self.hub.create_notification(body);
            self.hub.enqueue_to(message, subscriber);
        }
        result
    }

    /// Subscribes a client to the node at the given path.
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be resolved.
    pub fn subscribe(&self, client_id: &str, path: &str) -> Result<(), TreeError> {
        let mut tree = self.tree.write();
        let node = tree.resolve(path)?;
        tree.subscribe(node, client_id)
    }

    /// Unsubscribes a client from the node at the given path, decrementing
    /// its subscription count; `force` removes the client outright.
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be resolved, or when the client is not
    /// subscribed and `force` is not set.
    pub fn unsubscribe(&self, client_id: &str, path: &str, force: bool) -> Result<(), TreeError> {
        let mut tree = self.tree.write();
        let node = tree.resolve(path)?;
        tree.unsubscribe(node, client_id, force)
    }

    /// Unsubscribes the client from every subscribed path that lies under
    /// any of the filter paths: the filter is expanded to the matching
    /// subscriptions first, then each path is unsubscribed once (or
    /// outright, with `force`).
    ///
    /// Returns the paths the client was unsubscribed from. Backs the
    /// `includeSubtrees` flag of `DEV-UNSUB`.
    ///
    /// # Errors
    ///
    /// Fails when a filter path cannot be resolved.
    pub fn unsubscribe_subtree(
        &self,
        client_id: &str,
        path_filter: &[String],
        force: bool,
    ) -> Result<Vec<String>, TreeError> {
        let mut tree = self.tree.write();
        let subscriptions = tree.collect_subscriptions(client_id, path_filter)?;
        let mut removed = Vec::new();
        for path in subscriptions.keys() {
            let node = tree.resolve(path)?;
            tree.unsubscribe(node, client_id, force)?;
            removed.push(path.clone());
        }
        Ok(removed)
    }

    /// Lists the subscriptions of a client as a path -> multiplicity map,
    /// restricted to the subtrees of the filter paths (the whole tree when
    /// the filter is empty).
    ///
    /// # Errors
    ///
    /// Fails when a filter path cannot be resolved.
    pub fn list_subscriptions(
        &self,
        client_id: &str,
        path_filter: &[String],
    ) -> Result<BTreeMap<String, usize>, TreeError> {
        self.tree.read().collect_subscriptions(client_id, path_filter)
    }

    /// Force-clears every subscription of a client, in one traversal.
    ///
    /// Called when the client disconnects.
    pub fn remove_client(&self, client_id: &str) {
        self.tree.write().remove_client_subscriptions(client_id);
    }

    /// Builds a `DEV-INF` body with the channel values under each given
    /// path; unresolvable paths are recorded in the error map.
    #[must_use]
    pub fn create_dev_inf_body(&self, paths: &[String]) -> ResponseBody {
        let tree = self.tree.read();
        let mut body = ResponseBody::with_type("DEV-INF");
        let mut values = Map::new();
        for path in paths {
            match tree
                .resolve(path)
                .and_then(|node| tree.collect_channel_values(node))
            {
                Ok(snapshot) => {
                    values.insert(path.clone(), snapshot);
                }
                Err(_) => body.add_error(path, "No such device tree path"),
            }
        }
        body.insert("values", Value::Object(values));
        body
    }

    /// Builds a `DEV-LIST` body with the structural tree of each given
    /// object id.
    #[must_use]
    pub fn create_dev_list_body(&self, object_ids: &[String]) -> ResponseBody {
        let tree = self.tree.read();
        let mut body = ResponseBody::with_type("DEV-LIST");
        let mut status = Map::new();
        for object_id in object_ids {
            match tree
                .resolve(&format!("/{object_id}"))
                .and_then(|node| tree.node_json(node))
            {
                Ok(json) => {
                    status.insert(object_id.clone(), json);
                }
                Err(_) => body.add_error(object_id, "No such object"),
            }
        }
        body.insert("status", Value::Object(status));
        body
    }
}

impl std::fmt::Debug for DeviceTreeSubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTreeSubscriptionManager")
            .finish_non_exhaustive()
    }
}

/// Computes the per-subscriber `values` maps for one committed mutation:
/// the union of the ancestor chains of the changed channels, restricted to
/// nodes with subscribers, snapshotted once per (subscriber, path).
fn subscriber_batches(
    tree: &DeviceTree,
    changed: &[NodeId],
) -> HashMap<String, BTreeMap<String, Value>> {
    let mut affected: Vec<NodeId> = Vec::new();
    for node in changed {
        for ancestor in tree.ancestors_of(*node, true) {
            if !affected.contains(&ancestor) {
                affected.push(ancestor);
            }
        }
    }

    let mut batches: HashMap<String, BTreeMap<String, Value>> = HashMap::new();
    for node in affected {
        if !tree.has_subscribers(node) {
            continue;
        }
        let Ok(path) = tree.path_of(node) else {
            continue;
        };
        let path = if path.is_empty() { "/".to_owned() } else { path.to_owned() };
        let Ok(snapshot) = tree.collect_channel_values(node) else {
            continue;
        };
        for subscriber in tree.subscribers_of(node) {
            batches
                .entry(subscriber)
                .or_default()
                .insert(path.clone(), snapshot.clone());
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use fleetlink_core::{ChannelKind, DeviceClass, Envelope};

    use crate::channel::QueueChannel;
    use crate::registry::channel_types::ChannelTypeDescriptor;
    use crate::registry::{ChannelTypeRegistry, ClientRegistry};

    use super::*;

    struct Rig {
        manager: Arc<DeviceTreeSubscriptionManager>,
        clients: Arc<ClientRegistry>,
        rx_store: Arc<parking_lot::Mutex<Vec<mpsc::Receiver<Envelope>>>>,
        _dispatcher: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn make_rig() -> Rig {
        let rx_store: Arc<parking_lot::Mutex<Vec<mpsc::Receiver<Envelope>>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let channel_types = Arc::new(ChannelTypeRegistry::new());
        let store = Arc::clone(&rx_store);
        channel_types.add(ChannelTypeDescriptor::new(
            "inproc",
            Arc::new(move || {
                let (channel, rx) = QueueChannel::new(64);
                store.lock().push(rx);
                channel
            }),
        ));
        let clients = Arc::new(ClientRegistry::new(Arc::clone(&channel_types)));
        let hub = MessageHub::new(64);
        hub.set_channel_type_registry(channel_types);
        hub.set_client_registry(Arc::clone(&clients));
        let dispatcher = tokio::spawn(Arc::clone(&hub).run());

        let manager = Arc::new(DeviceTreeSubscriptionManager::new(hub));
        manager.with_tree_mut(|tree| {
            let object = tree.add_object("DRN-01").unwrap();
            let battery = tree
                .add_device(object, "battery", DeviceClass::Battery)
                .unwrap();
            tree.add_channel(battery, "voltage", ChannelKind::Number, Some("V"))
                .unwrap();
            tree.add_channel(battery, "percentage", ChannelKind::Number, Some("%"))
                .unwrap();
        });

        Rig {
            manager,
            clients,
            rx_store,
            _dispatcher: dispatcher,
        }
    }

    impl Rig {
        fn connect(&self, id: &str) -> mpsc::Receiver<Envelope> {
            self.clients.add(id, "inproc").unwrap();
            self.rx_store.lock().pop().unwrap()
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for DEV-INF")
            .expect("channel closed")
    }

    fn assert_no_message(rx: &mut mpsc::Receiver<Envelope>) {
        assert!(rx.try_recv().is_err(), "expected no pending message");
    }

    #[tokio::test]
    async fn subscriber_gets_one_dev_inf_per_commit() {
        let rig = make_rig();
        let mut rx = rig.connect("client-1");
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();

        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.4)).unwrap();
            m.update_path("/DRN-01/battery/percentage", json!(87)).unwrap();
        });

        let message = recv(&mut rx).await;
        assert_eq!(message.message_type(), Some("DEV-INF"));
        assert_eq!(
            message.body["values"]["/DRN-01/battery"],
            json!({ "voltage": 12.4, "percentage": 87 })
        );

        // One commit, one message.
        tokio::task::yield_now().await;
        assert_no_message(&mut rx);
    }

    #[tokio::test]
    async fn unchanged_value_produces_no_message() {
        let rig = make_rig();
        let mut rx = rig.connect("client-1");
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();

        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.3)).unwrap();
        });
        let first = recv(&mut rx).await;
        assert_eq!(first.body["values"]["/DRN-01/battery"]["voltage"], 12.3);

        // Writing the same value again is not a change.
        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.3)).unwrap();
        });
        tokio::task::yield_now().await;
        assert_no_message(&mut rx);
    }

    #[tokio::test]
    async fn unsubscribed_clients_are_not_notified() {
        let rig = make_rig();
        let mut rx_subscribed = rig.connect("client-1");
        let mut rx_other = rig.connect("client-2");
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();

        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(11.8)).unwrap();
        });

        let _ = recv(&mut rx_subscribed).await;
        tokio::task::yield_now().await;
        assert_no_message(&mut rx_other);
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_paths() {
        let rig = make_rig();
        let mut rx_battery = rig.connect("client-battery");
        let mut rx_voltage = rig.connect("client-voltage");
        rig.manager
            .subscribe("client-battery", "/DRN-01/battery")
            .unwrap();
        rig.manager
            .subscribe("client-voltage", "/DRN-01/battery/voltage")
            .unwrap();

        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.0)).unwrap();
        });

        let battery_message = recv(&mut rx_battery).await;
        let values = battery_message.body["values"].as_object().unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains_key("/DRN-01/battery"));

        let voltage_message = recv(&mut rx_voltage).await;
        let values = voltage_message.body["values"].as_object().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["/DRN-01/battery/voltage"], 12.0);
    }

    #[tokio::test]
    async fn subscriber_on_both_ancestors_gets_one_message_with_both_paths() {
        let rig = make_rig();
        let mut rx = rig.connect("client-1");
        rig.manager.subscribe("client-1", "/DRN-01").unwrap();
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();

        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.0)).unwrap();
        });

        let message = recv(&mut rx).await;
        let values = message.body["values"].as_object().unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.contains_key("/DRN-01"));
        assert!(values.contains_key("/DRN-01/battery"));

        tokio::task::yield_now().await;
        assert_no_message(&mut rx);
    }

    #[tokio::test]
    async fn disconnect_force_clears_subscriptions() {
        let rig = make_rig();
        let mut rx = rig.connect("client-1");
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();

        rig.manager.remove_client("client-1");
        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(9.9)).unwrap();
        });

        tokio::task::yield_now().await;
        assert_no_message(&mut rx);
        assert!(rig
            .manager
            .list_subscriptions("client-1", &[])
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_and_unsubscribe_subtree() {
        let rig = make_rig();
        let _rx = rig.connect("client-1");
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();
        rig.manager.subscribe("client-1", "/DRN-01/battery").unwrap();
        rig.manager
            .subscribe("client-1", "/DRN-01/battery/voltage")
            .unwrap();

        let subscriptions = rig.manager.list_subscriptions("client-1", &[]).unwrap();
        assert_eq!(subscriptions.get("/DRN-01/battery"), Some(&2));
        assert_eq!(subscriptions.get("/DRN-01/battery/voltage"), Some(&1));

        // One decrement per subscribed path under the filter.
        let removed = rig
            .manager
            .unsubscribe_subtree("client-1", &["/DRN-01".to_owned()], false)
            .unwrap();
        assert_eq!(
            removed,
            vec!["/DRN-01/battery".to_owned(), "/DRN-01/battery/voltage".to_owned()]
        );
        let subscriptions = rig.manager.list_subscriptions("client-1", &[]).unwrap();
        assert_eq!(subscriptions.get("/DRN-01/battery"), Some(&1));
        assert_eq!(subscriptions.get("/DRN-01/battery/voltage"), None);

        // With force, the remaining multi-subscription goes away entirely.
        let removed = rig
            .manager
            .unsubscribe_subtree("client-1", &["/DRN-01".to_owned()], true)
            .unwrap();
        assert_eq!(removed, vec!["/DRN-01/battery".to_owned()]);
        assert!(rig
            .manager
            .list_subscriptions("client-1", &[])
            .unwrap()
            .is_empty());

        // An unresolvable filter path is an error.
        assert!(rig
            .manager
            .unsubscribe_subtree("client-1", &["/nope".to_owned()], false)
            .is_err());
    }

    #[tokio::test]
    async fn subscribe_to_missing_path_fails() {
        let rig = make_rig();
        let _rx = rig.connect("client-1");
        assert!(matches!(
            rig.manager.subscribe("client-1", "/DRN-99"),
            Err(TreeError::NoSuchPath(_))
        ));
        assert!(matches!(
            rig.manager.unsubscribe("client-1", "/DRN-01/battery", false),
            Err(TreeError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn dev_inf_body_reports_values_and_errors() {
        let rig = make_rig();
        rig.manager.mutate(|m| {
            m.update_path("/DRN-01/battery/voltage", json!(12.4)).unwrap();
        });

        let body = rig
            .manager
            .create_dev_inf_body(&["/DRN-01/battery".to_owned(), "/nope".to_owned()])
            .into_value();
        assert_eq!(body["values"]["/DRN-01/battery"]["voltage"], 12.4);
        assert_eq!(body["error"]["/nope"], "No such device tree path");
    }

    #[tokio::test]
    async fn dev_list_body_reports_structure() {
        let rig = make_rig();
        let body = rig
            .manager
            .create_dev_list_body(&["DRN-01".to_owned(), "GHOST".to_owned()])
            .into_value();
        assert_eq!(body["status"]["DRN-01"]["type"], "object");
        assert_eq!(
            body["status"]["DRN-01"]["children"]["battery"]["type"],
            "device"
        );
        assert_eq!(body["error"]["GHOST"], "No such object");
    }
}
