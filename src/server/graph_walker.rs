//! Computes which clients can reach which nodes, constrained by a typed
//! white-list.
//!
//! The walker owns a FIFO work queue drained on its own turn of the server
//! pump, so closure walks never recurse through notification handlers. Two
//! kinds of work exist: joining new interest onto the subgraph made reachable
//! by a link add, and recomputing interest from scratch for clients whose
//! reachability a link remove may have invalidated.

use std::collections::VecDeque;
use std::mem;

use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, trace};

use super::ServerConfig;
use super::client::ClientRegistry;
use super::exporter::{Exporter, TrackerKind};
use super::update::StateRef;
use crate::bitset::BitSet;
use crate::graph::{Graph, LinkId, NodeId};

/// The capability-class white-list constraining every traversal.
///
/// An edge may be followed from a node when its metadata type is allowed and
/// the neighbor's node type is allowed as an adjacency of the current node's
/// type. Everything else is invisible to clients.
#[derive(Debug, Default)]
pub struct TraversalWhiteList {
    allowed_metadata: FnvHashSet<String>,
    allowed_neighbors: FnvHashMap<String, FnvHashSet<String>>,
}

impl TraversalWhiteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows edges with the given metadata type.
    pub fn allow_metadata(&mut self, metadata: &str) -> &mut Self {
        self.allowed_metadata.insert(metadata.to_owned());
        self
    }

    /// Allows traversal from nodes of `from_type` to neighbors of `to_type`.
    pub fn allow_neighbor(&mut self, from_type: &str, to_type: &str) -> &mut Self {
        self.allowed_neighbors
            .entry(from_type.to_owned())
            .or_default()
            .insert(to_type.to_owned());
        self
    }

    pub fn metadata_allowed(&self, metadata: &str) -> bool {
        self.allowed_metadata.contains(metadata)
    }

    pub fn neighbor_allowed(&self, from_type: &str, to_type: &str) -> bool {
        self.allowed_neighbors
            .get(from_type)
            .is_some_and(|types| types.contains(to_type))
    }
}

enum WorkItem {
    /// Spread `bits` over the closure reachable from `start`.
    Join { start: NodeId, bits: BitSet },
    /// Re-derive interest for every client accumulated in `rm_mask`.
    Recompute,
}

pub struct GraphWalker {
    white_list: TraversalWhiteList,
    work_queue: VecDeque<WorkItem>,
    /// Clients whose reachability may have shrunk since the last recompute.
    rm_mask: BitSet,
}

impl GraphWalker {
    pub fn new(white_list: TraversalWhiteList) -> Self {
        Self {
            white_list,
            work_queue: VecDeque::new(),
            rm_mask: BitSet::new(),
        }
    }

    pub fn white_list(&self) -> &TraversalWhiteList {
        &self.white_list
    }

    /// Returns whether `link` may be followed out of `from`.
    pub fn edge_allowed(&self, graph: &Graph, from: NodeId, link: LinkId) -> bool {
        if graph.link(link).is_deleted() {
            return false;
        }
        if !self.white_list.metadata_allowed(graph.link(link).metadata()) {
            return false;
        }
        let to = graph.other_endpoint(link, from);
        graph.node_feasible(to)
            && self
                .white_list
                .neighbor_allowed(graph.node(from).node_type(), graph.node(to).node_type())
    }

    /// Schedules closure walks for a link add.
    ///
    /// Clients interested in one endpoint but not the other gain the closure
    /// on the far side, so each direction with a non-empty difference gets a
    /// walk starting at the newly reachable endpoint.
    pub fn link_add(&mut self, graph: &Graph, link: LinkId, lset: &BitSet, rset: &BitSet) {
        let (left, right) = graph.endpoints(link);
        let l_not_r = lset.difference(rset);
        if !l_not_r.is_empty() && self.edge_allowed(graph, left, link) {
            trace!(
                "join walk from {} for {}",
                graph.node(right).name(),
                l_not_r.to_numbered_string()
            );
            self.work_queue.push_back(WorkItem::Join {
                start: right,
                bits: l_not_r,
            });
        }
        let r_not_l = rset.difference(lset);
        if !r_not_l.is_empty() && self.edge_allowed(graph, right, link) {
            trace!(
                "join walk from {} for {}",
                graph.node(left).name(),
                r_not_l.to_numbered_string()
            );
            self.work_queue.push_back(WorkItem::Join {
                start: left,
                bits: r_not_l,
            });
        }
    }

    /// Schedules an interest recompute for the given clients.
    pub fn link_remove(&mut self, bits: &BitSet) {
        if bits.is_empty() {
            return;
        }
        self.rm_mask |= bits;
        self.work_queue.push_back(WorkItem::Recompute);
    }

    /// Forgets unregistered clients before their recompute runs.
    pub fn reset_link_delete_clients(&mut self, bits: &BitSet) {
        self.rm_mask.subtract(bits);
    }

    pub fn has_work(&self) -> bool {
        !self.work_queue.is_empty()
    }

    /// Drains the work queue. Runs on the walker's turn of the server pump.
    pub(crate) fn run_work(
        &mut self,
        graph: &mut Graph,
        exporter: &mut Exporter,
        clients: &ClientRegistry,
        config: &ServerConfig,
    ) {
        while let Some(item) = self.work_queue.pop_front() {
            match item {
                WorkItem::Join { start, bits } => self.join_walk(graph, exporter, start, &bits),
                WorkItem::Recompute => self.recompute_walk(graph, exporter, clients, config),
            }
        }
    }

    /// Breadth-first walk joining `bits` onto every reachable node.
    ///
    /// Each visited node is re-notified together with its dependent links so
    /// the exporter can emit the adds in dependency order.
    fn join_walk(&mut self, graph: &mut Graph, exporter: &mut Exporter, start: NodeId, bits: &BitSet) {
        if !graph.node_feasible(start) {
            return;
        }
        let mut visited = FnvHashSet::default();
        let mut pending = VecDeque::new();
        visited.insert(start);
        pending.push_back(start);

        while let Some(node) = pending.pop_front() {
            exporter.node_state_locate(node);
            exporter.state_interest_or(StateRef::Node(node), bits);
            graph.notify_node(node);
            let dependents: Vec<LinkId> = exporter
                .node_state(node)
                .expect("state located above")
                .dependents
                .iter()
                .copied()
                .collect();
            for link in dependents {
                graph.notify_link(link);
            }

            for link in graph.adjacent_links(node) {
                if !self.edge_allowed(graph, node, link) {
                    continue;
                }
                let neighbor = graph.other_endpoint(link, node);
                if visited.insert(neighbor) {
                    pending.push_back(neighbor);
                }
            }
        }
    }

    /// Re-derives interest for every client in `rm_mask` by walking from its
    /// anchor node, then applies the difference to all affected states.
    fn recompute_walk(
        &mut self,
        graph: &mut Graph,
        exporter: &mut Exporter,
        clients: &ClientRegistry,
        config: &ServerConfig,
    ) {
        if self.rm_mask.is_empty() {
            return;
        }
        let rm_mask = mem::take(&mut self.rm_mask);
        debug!("interest recompute for {}", rm_mask.to_numbered_string());

        let mut candidates = FnvHashSet::default();
        for bit in rm_mask.ones() {
            let Some(identifier) = clients.identifier(bit) else {
                continue;
            };
            let Some(anchor) = graph.find_node(&config.anchor_node_type, identifier) else {
                continue;
            };
            if !graph.node_feasible(anchor) {
                continue;
            }

            let mut visited = FnvHashSet::default();
            let mut pending = VecDeque::new();
            visited.insert(anchor);
            pending.push_back(anchor);
            while let Some(node) = pending.pop_front() {
                exporter.node_state_locate(node).nmask.set(bit);
                candidates.insert(node);
                for link in graph.adjacent_links(node) {
                    if !self.edge_allowed(graph, node, link) {
                        continue;
                    }
                    let neighbor = graph.other_endpoint(link, node);
                    if visited.insert(neighbor) {
                        pending.push_back(neighbor);
                    }
                }
            }
        }

        // States the clients were interested in but the walks never reached
        // lose their bits too.
        for bit in rm_mask.ones() {
            if let Some(states) = exporter.tracker_states(TrackerKind::Interest, bit) {
                for target in states {
                    if let StateRef::Node(id) = target {
                        candidates.insert(*id);
                    }
                }
            }
        }

        for node in candidates {
            let Some(state) = exporter.node_state_mut(node) else {
                continue;
            };
            let nmask = mem::take(&mut state.nmask);
            let current = state.data.interest().clone();
            let mut recomputed = current.difference(&rm_mask);
            recomputed |= &nmask;
            if current != recomputed {
                exporter.state_interest_set(StateRef::Node(node), recomputed);
                graph.notify_node(node);
            }
        }
    }
}
