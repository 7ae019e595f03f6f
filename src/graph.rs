//! Typed configuration graph and its change notifications.
//!
//! The graph plays the role of the database tables: the configuration
//! ingestion side mutates it, every mutation (and explicit re-notify) is
//! recorded as a [`GraphEvent`], and the server drains those events into the
//! exporter on its own turn. Entries are only marked deleted here; storage is
//! reclaimed once the exporter has finished withdrawing them from clients.

use std::collections::VecDeque;

use bytes::Bytes;
use fnv::FnvHashMap;
use petgraph::{Undirected, stable_graph::StableGraph, visit::EdgeRef};

pub use petgraph::stable_graph::{EdgeIndex as LinkId, NodeIndex as NodeId};

/// A typed identifier in the configuration graph.
#[derive(Debug)]
pub struct Node {
    node_type: String,
    name: String,
    config: Bytes,
    uuid: Option<String>,
    deleted: bool,
}

impl Node {
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque encoded properties, as produced by the configuration pipeline.
    pub fn config(&self) -> &Bytes {
        &self.config
    }

    /// External UUID, present on node types registered by UUID (VMs).
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// A typed edge between two nodes.
#[derive(Debug)]
pub struct Link {
    metadata: String,
    deleted: bool,
}

impl Link {
    /// Metadata type of the edge, e.g. `virtual-router-virtual-machine`.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// A change notification, drained by the server pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEvent {
    Node(NodeId),
    Link(LinkId),
}

/// The shared configuration graph.
///
/// Node and link ids are stable for the lifetime of the entry, including the
/// window between deletion and [`purge`](Self::purge_node); pending updates
/// and exporter state keep referring to entries by id during withdrawal.
#[derive(Default)]
pub struct Graph {
    storage: StableGraph<Node, Link, Undirected>,
    by_name: FnvHashMap<(String, String), NodeId>,
    events: VecDeque<GraphEvent>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, reviving it if a deleted entry with the same identity
    /// is still awaiting withdrawal. Notifies listeners.
    pub fn insert_node(&mut self, node_type: &str, name: &str) -> NodeId {
        let key = (node_type.to_owned(), name.to_owned());
        let id = match self.by_name.get(&key) {
            Some(&id) => {
                self.storage[id].deleted = false;
                id
            }
            None => {
                let id = self.storage.add_node(Node {
                    node_type: key.0.clone(),
                    name: key.1.clone(),
                    config: Bytes::new(),
                    uuid: None,
                    deleted: false,
                });
                self.by_name.insert(key, id);
                id
            }
        };
        self.notify_node(id);
        id
    }

    /// Replaces the node's opaque config payload and notifies listeners.
    pub fn set_config(&mut self, id: NodeId, config: Bytes) {
        self.storage[id].config = config;
        self.notify_node(id);
    }

    /// Associates an external UUID with the node and notifies listeners.
    pub fn set_uuid(&mut self, id: NodeId, uuid: &str) {
        self.storage[id].uuid = Some(uuid.to_owned());
        self.notify_node(id);
    }

    /// Marks a node deleted and notifies listeners. The entry stays
    /// addressable until [`purge_node`](Self::purge_node).
    pub fn delete_node(&mut self, id: NodeId) {
        self.storage[id].deleted = true;
        self.notify_node(id);
    }

    /// Inserts a link between two nodes, reviving a deleted entry with the
    /// same endpoints and metadata when one exists. Notifies listeners.
    pub fn insert_link(&mut self, left: NodeId, right: NodeId, metadata: &str) -> LinkId {
        let existing = self
            .storage
            .edges_connecting(left, right)
            .find(|edge| edge.weight().metadata == metadata)
            .map(|edge| edge.id());
        let id = match existing {
            Some(id) => {
                self.storage[id].deleted = false;
                id
            }
            None => self.storage.add_edge(
                left,
                right,
                Link {
                    metadata: metadata.to_owned(),
                    deleted: false,
                },
            ),
        };
        self.notify_link(id);
        id
    }

    /// Marks a link deleted and notifies listeners.
    pub fn delete_link(&mut self, id: LinkId) {
        self.storage[id].deleted = true;
        self.notify_link(id);
    }

    /// Re-notifies listeners about a node without changing it.
    pub fn notify_node(&mut self, id: NodeId) {
        self.events.push_back(GraphEvent::Node(id));
    }

    /// Re-notifies listeners about a link without changing it.
    pub fn notify_link(&mut self, id: LinkId) {
        self.events.push_back(GraphEvent::Link(id));
    }

    /// Reclaims the storage of a deleted node with no remaining links.
    pub fn purge_node(&mut self, id: NodeId) {
        debug_assert!(self.storage[id].deleted);
        debug_assert_eq!(self.storage.edges(id).count(), 0);
        let node = self
            .storage
            .remove_node(id)
            .expect("purged node must exist");
        self.by_name.remove(&(node.node_type, node.name));
    }

    /// Reclaims the storage of a deleted link.
    pub fn purge_link(&mut self, id: LinkId) {
        debug_assert!(self.storage[id].deleted);
        self.storage.remove_edge(id);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.storage[id]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.storage[id]
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.storage.node_weight(id).is_some()
    }

    pub fn contains_link(&self, id: LinkId) -> bool {
        self.storage.edge_weight(id).is_some()
    }

    /// Looks a node up by type and name.
    pub fn find_node(&self, node_type: &str, name: &str) -> Option<NodeId> {
        self.by_name
            .get(&(node_type.to_owned(), name.to_owned()))
            .copied()
    }

    /// Looks a link up by its endpoints and metadata type.
    pub fn find_link(&self, left: NodeId, right: NodeId, metadata: &str) -> Option<LinkId> {
        self.storage
            .edges_connecting(left, right)
            .find(|edge| edge.weight().metadata == metadata)
            .map(|edge| edge.id())
    }

    /// Returns the `(left, right)` endpoints of a link.
    pub fn endpoints(&self, id: LinkId) -> (NodeId, NodeId) {
        self.storage
            .edge_endpoints(id)
            .expect("link endpoints must exist")
    }

    /// Returns the endpoint of `link` that is not `node`.
    pub fn other_endpoint(&self, link: LinkId, node: NodeId) -> NodeId {
        let (left, right) = self.endpoints(link);
        if left == node { right } else { left }
    }

    /// Returns the ids of all links incident to a node.
    ///
    /// Collected eagerly so callers may notify or mutate while iterating.
    pub fn adjacent_links(&self, id: NodeId) -> Vec<LinkId> {
        self.storage.edges(id).map(|edge| edge.id()).collect()
    }

    /// Returns whether the node exists and is not marked deleted.
    pub fn node_feasible(&self, id: NodeId) -> bool {
        self.storage
            .node_weight(id)
            .is_some_and(|node| !node.deleted)
    }

    pub fn pop_event(&mut self) -> Option<GraphEvent> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.storage.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.storage.edge_count()
    }
}
