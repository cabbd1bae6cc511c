//! Per-object hierarchical device tree.
//!
//! Every tracked object may expose a subtree of devices and typed channels
//! under a shared anonymous root: `/object/device/.../channel`. Channel nodes
//! carry a typed value; clients subscribe to arbitrary nodes and are notified
//! about changes in the subtree below their subscription.
//!
//! Nodes live in an arena indexed by [`NodeId`]; parent and child links are
//! indices, which keeps the tree free of reference cycles. Each node caches
//! its path, computed when the node is attached.
//!
//! Channel values are only ever modified through a mutator session (see
//! [`DeviceTree::mutate`]): the session collects the set of channel nodes
//! whose value actually changed and reports them once on commit, so a single
//! burst of updates produces a single notification per subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised by device tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("no such path in device tree: {0}")]
    NoSuchPath(String),
    #[error("invalid device tree path: {0}")]
    InvalidPath(String),
    #[error("another child named {0:?} already exists")]
    DuplicateChild(String),
    #[error("node is not a channel: {0}")]
    NotAChannel(String),
    #[error("channel nodes cannot have children: {0}")]
    ChildOfChannel(String),
    #[error("client {client} is not subscribed to {path}")]
    NotSubscribed { client: String, path: String },
    #[error("node is not part of the tree")]
    DetachedNode,
}

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Value type of a channel node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Number,
    String,
    Boolean,
    Object,
}

/// Operations a channel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOperation {
    Read,
    Write,
}

/// Coarse classification of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Accelerometer,
    Altimeter,
    Battery,
    Camera,
    Gps,
    Gyroscope,
    Magnetometer,
    Radio,
    Rangefinder,
    #[default]
    Misc,
}

/// A path in the device tree, `/object/device/.../channel`.
///
/// The root path is `/`. Paths must start with a slash and contain no empty
/// components; a single trailing slash is tolerated and stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreePath {
    parts: Vec<String>,
}

impl TreePath {
    /// The root path.
    #[must_use]
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    /// Returns the path components below the root.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Returns whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }
}

impl FromStr for TreePath {
    type Err = TreeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let Some(rest) = text.strip_prefix('/') else {
            return Err(TreeError::InvalidPath(text.to_owned()));
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let parts: Vec<String> = rest.split('/').map(str::to_owned).collect();
        if parts.iter().any(String::is_empty) {
            return Err(TreeError::InvalidPath(text.to_owned()));
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            f.write_str("/")
        } else {
            for part in &self.parts {
                write!(f, "/{part}")?;
            }
            Ok(())
        }
    }
}

enum NodeBody {
    Root,
    Object,
    Device {
        class: DeviceClass,
    },
    Channel {
        kind: ChannelKind,
        operations: Vec<ChannelOperation>,
        unit: Option<String>,
        value: Value,
    },
}

struct Node {
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    /// Cached path; `""` for the root so child paths concatenate cleanly.
    path: String,
    body: NodeBody,
    /// Subscription multiset: client id -> reference count.
    subscribers: BTreeMap<String, usize>,
}

impl Node {
    fn new(body: NodeBody) -> Self {
        Self {
            parent: None,
            children: BTreeMap::new(),
            path: String::new(),
            body,
            subscribers: BTreeMap::new(),
        }
    }
}

/// The device tree of the server: object subtrees under one anonymous root.
pub struct DeviceTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: NodeId,
}

impl DeviceTree {
    /// Creates an empty tree containing only the root node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::new(NodeBody::Root))],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(TreeError::DetachedNode)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, TreeError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::DetachedNode)
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(node);
            NodeId(index)
        } else {
            self.nodes.push(Some(node));
            NodeId(self.nodes.len() - 1)
        }
    }

    fn attach(&mut self, parent: NodeId, name: &str, body: NodeBody) -> Result<NodeId, TreeError> {
        {
            let parent_node = self.node(parent)?;
            if matches!(parent_node.body, NodeBody::Channel { .. }) {
                return Err(TreeError::ChildOfChannel(name.to_owned()));
            }
            if parent_node.children.contains_key(name) {
                return Err(TreeError::DuplicateChild(name.to_owned()));
            }
        }
        let path = format!("{}/{}", self.node(parent)?.path, name);
        let id = self.alloc(Node::new(body));
        if let Some(node) = self.nodes[id.0].as_mut() {
            node.parent = Some(parent);
            node.path = path;
        }
        self.node_mut(parent)?.children.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Adds an object node with the given id under the root.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DuplicateChild`] if an object with this id is
    /// already attached.
    pub fn add_object(&mut self, id: &str) -> Result<NodeId, TreeError> {
        self.attach(self.root, id, NodeBody::Object)
    }

    /// Removes the object node with the given id together with its subtree.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::NoSuchPath`] if there is no such object.
    pub fn remove_object(&mut self, id: &str) -> Result<(), TreeError> {
        let node_id = self
            .node(self.root)?
            .children
            .get(id)
            .copied()
            .ok_or_else(|| TreeError::NoSuchPath(format!("/{id}")))?;
        self.node_mut(self.root)?.children.remove(id);
        self.dispose(node_id);
        Ok(())
    }

    fn dispose(&mut self, id: NodeId) {
        let children: Vec<NodeId> = match self.nodes.get(id.0).and_then(Option::as_ref) {
            Some(node) => node.children.values().copied().collect(),
            None => return,
        };
        for child in children {
            self.dispose(child);
        }
        self.nodes[id.0] = None;
        self.free.push(id.0);
    }

    /// Adds a device node under the given parent.
    ///
    /// # Errors
    ///
    /// Fails when the parent is missing, is a channel, or already has a child
    /// with this name.
    pub fn add_device(
        &mut self,
        parent: NodeId,
        id: &str,
        class: DeviceClass,
    ) -> Result<NodeId, TreeError> {
        self.attach(parent, id, NodeBody::Device { class })
    }

    /// Adds a read-only channel node under the given parent.
    ///
    /// # Errors
    ///
    /// Fails when the parent is missing, is a channel, or already has a child
    /// with this name.
    pub fn add_channel(
        &mut self,
        parent: NodeId,
        id: &str,
        kind: ChannelKind,
        unit: Option<&str>,
    ) -> Result<NodeId, TreeError> {
        self.attach(
            parent,
            id,
            NodeBody::Channel {
                kind,
                operations: vec![ChannelOperation::Read],
                unit: unit.map(str::to_owned),
                value: Value::Null,
            },
        )
    }

    /// Resolves a path to a node.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::InvalidPath`] on a malformed path and
    /// [`TreeError::NoSuchPath`] when a component does not exist.
    pub fn resolve(&self, path: &str) -> Result<NodeId, TreeError> {
        let parsed: TreePath = path.parse()?;
        let mut node = self.root;
        for part in parsed.parts() {
            node = self
                .node(node)?
                .children
                .get(part)
                .copied()
                .ok_or_else(|| TreeError::NoSuchPath(path.to_owned()))?;
        }
        Ok(node)
    }

    /// Returns the cached path of a node (`""` for the root).
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DetachedNode`] if the node was removed.
    pub fn path_of(&self, id: NodeId) -> Result<&str, TreeError> {
        Ok(self.node(id)?.path.as_str())
    }

    /// Returns the current value of a channel node.
    ///
    /// # Errors
    ///
    /// Fails when the node was removed or is not a channel.
    pub fn value_of(&self, id: NodeId) -> Result<&Value, TreeError> {
        let node = self.node(id)?;
        match &node.body {
            NodeBody::Channel { value, .. } => Ok(value),
            _ => Err(TreeError::NotAChannel(node.path.clone())),
        }
    }

    /// Returns whether a node is a channel node.
    #[must_use]
    pub fn is_channel(&self, id: NodeId) -> bool {
        matches!(
            self.node(id),
            Ok(Node {
                body: NodeBody::Channel { .. },
                ..
            })
        )
    }

    /// Returns the named children of a node.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DetachedNode`] if the node was removed.
    pub fn children_of(&self, id: NodeId) -> Result<Vec<(String, NodeId)>, TreeError> {
        Ok(self
            .node(id)?
            .children
            .iter()
            .map(|(name, child)| (name.clone(), *child))
            .collect())
    }

    /// Returns the ancestors of a node, nearest first, optionally including
    /// the node itself.
    #[must_use]
    pub fn ancestors_of(&self, id: NodeId, include_self: bool) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut current = if include_self {
            Some(id)
        } else {
            self.node(id).ok().and_then(|node| node.parent)
        };
        while let Some(node_id) = current {
            result.push(node_id);
            current = self.node(node_id).ok().and_then(|node| node.parent);
        }
        result
    }

    /// Returns all nodes in the subtree of `from`, including `from`, in
    /// depth-first order.
    #[must_use]
    pub fn traverse_dfs(&self, from: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut queue = vec![from];
        while let Some(id) = queue.pop() {
            if let Ok(node) = self.node(id) {
                result.push(id);
                queue.extend(node.children.values().copied());
            }
        }
        result
    }

    /// Collects the channel values in the subtree of a node: channel nodes
    /// map to their value, container nodes map to an object keyed by child
    /// names.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DetachedNode`] if the node was removed.
    pub fn collect_channel_values(&self, id: NodeId) -> Result<Value, TreeError> {
        let node = self.node(id)?;
        match &node.body {
            NodeBody::Channel { value, .. } => Ok(value.clone()),
            _ => {
                let mut map = Map::new();
                for (name, child) in &node.children {
                    map.insert(name.clone(), self.collect_channel_values(*child)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// Returns the structural JSON representation of a node, as reported by
    /// `DEV-LIST` responses.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DetachedNode`] if the node was removed.
    pub fn node_json(&self, id: NodeId) -> Result<Value, TreeError> {
        let node = self.node(id)?;
        let mut map = Map::new();
        match &node.body {
            NodeBody::Root => {
                map.insert("type".to_owned(), Value::String("root".to_owned()));
            }
            NodeBody::Object => {
                map.insert("type".to_owned(), Value::String("object".to_owned()));
            }
            NodeBody::Device { class } => {
                map.insert("type".to_owned(), Value::String("device".to_owned()));
                map.insert("deviceClass".to_owned(), serde_json::json!(class));
            }
            NodeBody::Channel {
                kind,
                operations,
                unit,
                value,
            } => {
                map.insert("type".to_owned(), Value::String("channel".to_owned()));
                map.insert("subType".to_owned(), serde_json::json!(kind));
                map.insert("operations".to_owned(), serde_json::json!(operations));
                if let Some(unit) = unit {
                    map.insert("unit".to_owned(), Value::String(unit.clone()));
                }
                map.insert("value".to_owned(), value.clone());
            }
        }
        if !node.children.is_empty() {
            let mut children = Map::new();
            for (name, child) in &node.children {
                children.insert(name.clone(), self.node_json(*child)?);
            }
            map.insert("children".to_owned(), Value::Object(children));
        }
        Ok(Value::Object(map))
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribes a client to a node; repeated subscriptions increase the
    /// reference count.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::DetachedNode`] if the node was removed.
    pub fn subscribe(&mut self, id: NodeId, client: &str) -> Result<(), TreeError> {
        *self
            .node_mut(id)?
            .subscribers
            .entry(client.to_owned())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Unsubscribes a client from a node, decrementing the reference count.
    ///
    /// With `force`, the client is removed regardless of the count and a
    /// missing subscription is not an error.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::NotSubscribed`] when the client has no
    /// subscription on this node and `force` is not set.
    pub fn unsubscribe(&mut self, id: NodeId, client: &str, force: bool) -> Result<(), TreeError> {
        let path = self.node(id)?.path.clone();
        let node = self.node_mut(id)?;
        match node.subscribers.get_mut(client) {
            Some(_) if force => {
                node.subscribers.remove(client);
                Ok(())
            }
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    node.subscribers.remove(client);
                }
                Ok(())
            }
            None if force => Ok(()),
            None => Err(TreeError::NotSubscribed {
                client: client.to_owned(),
                path,
            }),
        }
    }

    /// Returns how many times a client is subscribed to a node.
    #[must_use]
    pub fn count_subscriptions_of(&self, id: NodeId, client: &str) -> usize {
        self.node(id)
            .ok()
            .and_then(|node| node.subscribers.get(client).copied())
            .unwrap_or(0)
    }

    /// Returns whether a node has at least one subscriber.
    #[must_use]
    pub fn has_subscribers(&self, id: NodeId) -> bool {
        self.node(id).is_ok_and(|node| !node.subscribers.is_empty())
    }

    /// Returns the unique subscribers of a node.
    #[must_use]
    pub fn subscribers_of(&self, id: NodeId) -> Vec<String> {
        self.node(id)
            .map(|node| node.subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every subscription of a client in a single traversal.
    ///
    /// Called when a client disconnects.
    pub fn remove_client_subscriptions(&mut self, client: &str) {
        for id in self.traverse_dfs(self.root) {
            if let Ok(node) = self.node_mut(id) {
                node.subscribers.remove(client);
            }
        }
    }

    /// Collects the subscriptions of a client in the subtrees matched by the
    /// given path filters, as a path -> multiplicity map.
    ///
    /// A node matched by several filter paths is counted once per match. An
    /// empty filter list means the whole tree.
    ///
    /// # Errors
    ///
    /// Fails when a filter path cannot be resolved.
    pub fn collect_subscriptions(
        &self,
        client: &str,
        path_filter: &[String],
    ) -> Result<BTreeMap<String, usize>, TreeError> {
        let mut result = BTreeMap::new();
        let roots = if path_filter.is_empty() {
            vec![self.root]
        } else {
            path_filter
                .iter()
                .map(|path| self.resolve(path))
                .collect::<Result<Vec<_>, _>>()?
        };
        for root in roots {
            for id in self.traverse_dfs(root) {
                let count = self.count_subscriptions_of(id, client);
                if count > 0 {
                    let path = self.node(id)?.path.clone();
                    let path = if path.is_empty() { "/".to_owned() } else { path };
                    *result.entry(path).or_insert(0) += count;
                }
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Runs a mutator session and returns the closure result together with
    /// the channel nodes whose value actually changed, each at most once.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut TreeMutator<'_>) -> R) -> (R, Vec<NodeId>) {
        let mut mutator = TreeMutator {
            tree: self,
            changed: Vec::new(),
        };
        let result = f(&mut mutator);
        let changed = mutator.changed;
        (result, changed)
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTree")
            .field("nodes", &(self.nodes.len() - self.free.len()))
            .finish()
    }
}

/// Transactional channel-value updates; see [`DeviceTree::mutate`].
pub struct TreeMutator<'a> {
    tree: &'a mut DeviceTree,
    changed: Vec<NodeId>,
}

impl TreeMutator<'_> {
    /// Updates a channel value; a value equal to the stored one is a no-op
    /// and does not mark the node as changed.
    ///
    /// # Errors
    ///
    /// Fails when the node was removed or is not a channel.
    pub fn update(&mut self, id: NodeId, new_value: Value) -> Result<(), TreeError> {
        let node = self.tree.node_mut(id)?;
        let NodeBody::Channel { value, .. } = &mut node.body else {
            return Err(TreeError::NotAChannel(node.path.clone()));
        };
        if *value == new_value {
            return Ok(());
        }
        *value = new_value;
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
        Ok(())
    }

    /// Updates the channel at the given path.
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be resolved or does not name a channel.
    pub fn update_path(&mut self, path: &str, new_value: Value) -> Result<(), TreeError> {
        let id = self.tree.resolve(path)?;
        self.update(id, new_value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Builds `/DRN-01/battery/{voltage,percentage}` and returns the channel ids.
    fn make_battery_tree() -> (DeviceTree, NodeId, NodeId) {
        let mut tree = DeviceTree::new();
        let object = tree.add_object("DRN-01").unwrap();
        let battery = tree
            .add_device(object, "battery", DeviceClass::Battery)
            .unwrap();
        let voltage = tree
            .add_channel(battery, "voltage", ChannelKind::Number, Some("V"))
            .unwrap();
        let percentage = tree
            .add_channel(battery, "percentage", ChannelKind::Number, Some("%"))
            .unwrap();
        (tree, voltage, percentage)
    }

    #[test]
    fn tree_path_parsing() {
        let path: TreePath = "/DRN-01/battery/voltage".parse().unwrap();
        assert_eq!(path.parts(), ["DRN-01", "battery", "voltage"]);
        assert_eq!(path.to_string(), "/DRN-01/battery/voltage");

        let root: TreePath = "/".parse().unwrap();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");

        // Trailing slash is tolerated.
        let path: TreePath = "/DRN-01/".parse().unwrap();
        assert_eq!(path.parts(), ["DRN-01"]);
    }

    #[test]
    fn tree_path_rejects_malformed_input() {
        assert!("no-leading-slash".parse::<TreePath>().is_err());
        assert!("/a//b".parse::<TreePath>().is_err());
        assert!("".parse::<TreePath>().is_err());
    }

    #[test]
    fn resolve_and_cached_paths() {
        let (tree, voltage, _) = make_battery_tree();
        assert_eq!(tree.resolve("/DRN-01/battery/voltage").unwrap(), voltage);
        assert_eq!(tree.path_of(voltage).unwrap(), "/DRN-01/battery/voltage");
        assert_eq!(tree.path_of(tree.root()).unwrap(), "");

        assert!(matches!(
            tree.resolve("/DRN-01/engine"),
            Err(TreeError::NoSuchPath(_))
        ));
    }

    #[test]
    fn duplicate_children_are_rejected() {
        let mut tree = DeviceTree::new();
        tree.add_object("a").unwrap();
        assert_eq!(
            tree.add_object("a").unwrap_err(),
            TreeError::DuplicateChild("a".to_owned())
        );
    }

    #[test]
    fn channels_cannot_have_children() {
        let (mut tree, voltage, _) = make_battery_tree();
        assert!(matches!(
            tree.add_channel(voltage, "sub", ChannelKind::Number, None),
            Err(TreeError::ChildOfChannel(_))
        ));
    }

    #[test]
    fn remove_object_detaches_subtree() {
        let (mut tree, voltage, _) = make_battery_tree();
        tree.remove_object("DRN-01").unwrap();

        assert!(tree.resolve("/DRN-01").is_err());
        assert_eq!(tree.path_of(voltage), Err(TreeError::DetachedNode));
        assert!(tree.remove_object("DRN-01").is_err());
    }

    #[test]
    fn collect_channel_values_snapshots_subtree() {
        let (mut tree, voltage, percentage) = make_battery_tree();
        tree.mutate(|m| {
            m.update(voltage, json!(12.4)).unwrap();
            m.update(percentage, json!(87)).unwrap();
        });

        let battery = tree.resolve("/DRN-01/battery").unwrap();
        assert_eq!(
            tree.collect_channel_values(battery).unwrap(),
            json!({ "voltage": 12.4, "percentage": 87 })
        );
        assert_eq!(tree.collect_channel_values(voltage).unwrap(), json!(12.4));
        assert!(tree.is_channel(voltage));
        assert!(!tree.is_channel(battery));
    }

    #[test]
    fn mutator_reports_only_actual_changes() {
        let (mut tree, voltage, percentage) = make_battery_tree();
        let ((), changed) = tree.mutate(|m| {
            m.update(voltage, json!(12.4)).unwrap();
        });
        assert_eq!(changed, vec![voltage]);

        // Same value again: no change reported.
        let ((), changed) = tree.mutate(|m| {
            m.update(voltage, json!(12.4)).unwrap();
        });
        assert!(changed.is_empty());

        // Two updates to the same node in one session count once.
        let ((), changed) = tree.mutate(|m| {
            m.update(voltage, json!(12.3)).unwrap();
            m.update(voltage, json!(12.2)).unwrap();
            m.update(percentage, json!(86)).unwrap();
        });
        assert_eq!(changed, vec![voltage, percentage]);
        assert_eq!(tree.value_of(voltage).unwrap(), &json!(12.2));
    }

    #[test]
    fn mutator_update_by_path() {
        let (mut tree, voltage, _) = make_battery_tree();
        let (result, changed) =
            tree.mutate(|m| m.update_path("/DRN-01/battery/voltage", json!(11.9)));
        result.unwrap();
        assert_eq!(changed, vec![voltage]);
    }

    #[test]
    fn mutator_rejects_non_channel_targets() {
        let (mut tree, _, _) = make_battery_tree();
        let (result, changed) = tree.mutate(|m| m.update_path("/DRN-01/battery", json!(1)));
        assert!(matches!(result, Err(TreeError::NotAChannel(_))));
        assert!(changed.is_empty());
    }

    #[test]
    fn subscription_reference_counting() {
        let (mut tree, _, _) = make_battery_tree();
        let battery = tree.resolve("/DRN-01/battery").unwrap();

        tree.subscribe(battery, "client-1").unwrap();
        tree.subscribe(battery, "client-1").unwrap();
        assert_eq!(tree.count_subscriptions_of(battery, "client-1"), 2);
        assert!(tree.has_subscribers(battery));

        tree.unsubscribe(battery, "client-1", false).unwrap();
        assert_eq!(tree.count_subscriptions_of(battery, "client-1"), 1);

        tree.unsubscribe(battery, "client-1", false).unwrap();
        assert_eq!(tree.count_subscriptions_of(battery, "client-1"), 0);
        assert!(!tree.has_subscribers(battery));

        assert!(matches!(
            tree.unsubscribe(battery, "client-1", false),
            Err(TreeError::NotSubscribed { .. })
        ));
    }

    #[test]
    fn force_unsubscribe_clears_all_references() {
        let (mut tree, _, _) = make_battery_tree();
        let battery = tree.resolve("/DRN-01/battery").unwrap();

        tree.subscribe(battery, "client-1").unwrap();
        tree.subscribe(battery, "client-1").unwrap();
        tree.unsubscribe(battery, "client-1", true).unwrap();
        assert_eq!(tree.count_subscriptions_of(battery, "client-1"), 0);

        // Forced unsubscription of an absent client is a no-op.
        tree.unsubscribe(battery, "client-1", true).unwrap();
    }

    #[test]
    fn remove_client_subscriptions_clears_everything() {
        let (mut tree, voltage, percentage) = make_battery_tree();
        let battery = tree.resolve("/DRN-01/battery").unwrap();

        tree.subscribe(battery, "client-1").unwrap();
        tree.subscribe(voltage, "client-1").unwrap();
        tree.subscribe(percentage, "client-2").unwrap();

        tree.remove_client_subscriptions("client-1");
        assert_eq!(tree.count_subscriptions_of(battery, "client-1"), 0);
        assert_eq!(tree.count_subscriptions_of(voltage, "client-1"), 0);
        assert_eq!(tree.count_subscriptions_of(percentage, "client-2"), 1);
    }

    #[test]
    fn collect_subscriptions_with_filters() {
        let (mut tree, voltage, _) = make_battery_tree();
        let battery = tree.resolve("/DRN-01/battery").unwrap();

        tree.subscribe(battery, "client-1").unwrap();
        tree.subscribe(battery, "client-1").unwrap();
        tree.subscribe(voltage, "client-1").unwrap();

        let all = tree.collect_subscriptions("client-1", &[]).unwrap();
        assert_eq!(all.get("/DRN-01/battery"), Some(&2));
        assert_eq!(all.get("/DRN-01/battery/voltage"), Some(&1));

        let filtered = tree
            .collect_subscriptions("client-1", &["/DRN-01/battery/voltage".to_owned()])
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("/DRN-01/battery/voltage"), Some(&1));

        assert!(tree
            .collect_subscriptions("client-1", &["/nope".to_owned()])
            .is_err());
    }

    #[test]
    fn ancestors_walk_up_to_root() {
        let (tree, voltage, _) = make_battery_tree();
        let battery = tree.resolve("/DRN-01/battery").unwrap();
        let object = tree.resolve("/DRN-01").unwrap();

        let ancestors = tree.ancestors_of(voltage, false);
        assert_eq!(ancestors, vec![battery, object, tree.root()]);

        let with_self = tree.ancestors_of(voltage, true);
        assert_eq!(with_self[0], voltage);
        assert_eq!(with_self.len(), 4);
    }

    #[test]
    fn node_json_reflects_structure() {
        let (mut tree, voltage, _) = make_battery_tree();
        tree.mutate(|m| m.update(voltage, json!(12.4)).unwrap());

        let object = tree.resolve("/DRN-01").unwrap();
        let value = tree.node_json(object).unwrap();
        assert_eq!(value["type"], "object");
        let battery = &value["children"]["battery"];
        assert_eq!(battery["type"], "device");
        assert_eq!(battery["deviceClass"], "battery");
        let channel = &battery["children"]["voltage"];
        assert_eq!(channel["type"], "channel");
        assert_eq!(channel["subType"], "number");
        assert_eq!(channel["unit"], "V");
        assert_eq!(channel["value"], 12.4);
    }

    #[test]
    fn node_slots_are_reused_after_removal() {
        let mut tree = DeviceTree::new();
        tree.add_object("a").unwrap();
        tree.remove_object("a").unwrap();
        let before = tree.nodes.len();
        tree.add_object("b").unwrap();
        assert_eq!(tree.nodes.len(), before);
    }
}
