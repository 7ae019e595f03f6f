//! Server orchestration: client lifecycle, VM subscriptions, introspection
//! and the cooperative pump driving exporter, walker and sender.

pub mod client;
pub mod exporter;
pub mod graph_walker;
pub mod introspect;
pub mod message;
pub mod update;
pub mod update_queue;
pub mod update_sender;
mod vm_registry;

use std::collections::VecDeque;

use log::{debug, warn};

use crate::bitset::BitSet;
use crate::graph::{Graph, GraphEvent, LinkId, NodeId};
use client::{Client, ClientRegistry, ClientStats};
use exporter::{ExportContext, Exporter, TrackerKind};
use graph_walker::{GraphWalker, TraversalWhiteList};
use introspect::{
    ClientHistoryEntry, ClientMapEntry, PendingVmRegEntry, QueueEntryInfo, ServerStats,
    UuidMapEntry,
};
use message::DEFAULT_OBJECTS_PER_MESSAGE;
use update::StateRef;
use update_queue::{QueueEntry, UpdateQueue};
use update_sender::{SenderHandle, UpdateSender};
use vm_registry::VmRegistry;

/// Schema-level knobs of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Node type representing a client itself; the origin of its reachable
    /// subgraph.
    pub anchor_node_type: String,
    /// Node type that clients subscribe to by UUID.
    pub vm_node_type: String,
    /// Metadata of the links created between an anchor and a subscribed VM.
    pub vr_vm_metadata: String,
    /// How many entries to batch into one message.
    pub objects_per_message: usize,
    /// How many unregistered clients to remember for introspection.
    pub client_history_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            anchor_node_type: "virtual-router".to_owned(),
            vm_node_type: "virtual-machine".to_owned(),
            vr_vm_metadata: "virtual-router-virtual-machine".to_owned(),
            objects_per_message: DEFAULT_OBJECTS_PER_MESSAGE,
            client_history_size: 16,
        }
    }
}

/// The server core: distributes the configuration graph to registered
/// clients, each filtered to the subgraph reachable from its anchor node.
pub struct Server {
    config: ServerConfig,
    graph: Graph,
    exporter: Exporter,
    queue: UpdateQueue,
    sender: UpdateSender,
    walker: GraphWalker,
    clients: ClientRegistry,
    vm_registry: VmRegistry,
    history: VecDeque<ClientHistoryEntry>,
    stats: ServerStats,
}

impl Server {
    pub fn new(config: ServerConfig, white_list: TraversalWhiteList) -> Self {
        let sender = UpdateSender::new(config.objects_per_message);
        Self {
            graph: Graph::new(),
            exporter: Exporter::new(),
            queue: UpdateQueue::new(),
            sender,
            walker: GraphWalker::new(white_list),
            clients: ClientRegistry::new(),
            vm_registry: VmRegistry::new(),
            history: VecDeque::new(),
            stats: ServerStats::default(),
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The configuration pipeline mutates the graph through this and then
    /// calls [`run`](Self::run) to propagate the changes.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Trigger side of the sender, for session layers to signal
    /// writability from their own threads.
    pub fn sender_handle(&self) -> SenderHandle {
        self.sender.handle()
    }

    pub fn is_client_blocked(&self, index: usize) -> bool {
        self.sender.is_client_blocked(index)
    }

    pub fn set_objects_per_message(&mut self, count: usize) {
        self.sender.set_objects_per_message(count);
    }

    pub fn client_index(&self, identifier: &str) -> Option<usize> {
        self.clients.find_index(identifier)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers a client and triggers its initial graph download.
    ///
    /// The returned index is the client's bit in every interest and
    /// advertised set until it unregisters.
    pub fn client_register(&mut self, client: Box<dyn Client>) -> usize {
        let index = self.clients.register(client);
        self.exporter.add_client_tracker(index);
        self.queue.join(index);
        self.stats.clients_registered += 1;
        self.client_graph_download(index);
        index
    }

    /// Unregisters a client, withdrawing its queue presence and releasing
    /// its index.
    ///
    /// A client that reconnects later is a new registration and receives a
    /// fresh download; there is no resumption.
    pub fn client_unregister(&mut self, identifier: &str) -> bool {
        let Some(index) = self.clients.find_index(identifier) else {
            return false;
        };
        self.remove_self_added_links(index);

        let vms: Vec<String> = self.clients.get(index).map_or_else(Vec::new, |info| {
            info.vms.iter().cloned().collect()
        });
        for uuid in &vms {
            self.vm_registry.cancel_pending(uuid, identifier);
        }

        if self.history.len() >= self.config.client_history_size {
            self.history.pop_front();
        }
        self.history.push_back(ClientHistoryEntry {
            identifier: identifier.to_owned(),
            index,
        });

        self.sender.cleanup_client(index);
        // Leave needs the trackers; exporter cleanup comes after.
        self.queue.leave(index, &mut self.exporter, &mut self.graph);
        self.exporter.cleanup_client_tracked(index);
        self.exporter.delete_client_tracker(index);
        self.walker.reset_link_delete_clients(&BitSet::single(index));
        self.clients.unregister(index);
        self.stats.clients_unregistered += 1;
        true
    }

    /// Connects or disconnects a VM from a client's anchor subgraph.
    ///
    /// Requests for unknown clients are dropped and counted. Subscriptions
    /// to VMs the configuration has not added yet wait in the pending list
    /// and are replayed when the node appears.
    pub fn vm_subscribe(&mut self, vr_name: &str, vm_uuid: &str, subscribe: bool) {
        let Some(index) = self.clients.find_index(vr_name) else {
            warn!("vm subscription for unknown client {vr_name}");
            self.stats.vm_subscribe_no_client += 1;
            return;
        };
        let node = self
            .vm_registry
            .node_by_uuid(vm_uuid)
            .filter(|&vm| self.graph.node_feasible(vm));
        match node {
            Some(vm) => self.apply_vm_subscribe(index, vm, vm_uuid, subscribe),
            None if subscribe => {
                self.stats.vm_subscribe_pending += 1;
                self.vm_registry.set_pending(vm_uuid, vr_name);
                if let Some(info) = self.clients.get_mut(index) {
                    info.vms.insert(vm_uuid.to_owned());
                }
            }
            None => {
                // Unsubscribe for a VM that never materialized cancels any
                // parked subscription.
                self.vm_registry.cancel_pending(vm_uuid, vr_name);
                if let Some(info) = self.clients.get_mut(index) {
                    info.vms.remove(vm_uuid);
                }
            }
        }
    }

    /// Drives all pending work to quiescence: graph notifications into the
    /// exporter, then walker closure work, then send sweeps.
    ///
    /// Deterministic stand-in for the task groups of the original runtime;
    /// triggers raised while draining are observed in the same call.
    pub fn run(&mut self) -> postcard::Result<()> {
        loop {
            if let Some(event) = self.graph.pop_event() {
                self.dispatch_event(event);
                continue;
            }
            if self.walker.has_work() {
                self.walker
                    .run_work(&mut self.graph, &mut self.exporter, &self.clients, &self.config);
                continue;
            }
            if self.sender.run(
                &mut self.queue,
                &mut self.exporter,
                &mut self.clients,
                &mut self.graph,
            )? {
                continue;
            }
            return Ok(());
        }
    }

    /// Queue contents, head to tail.
    pub fn show_queue(&self) -> Vec<QueueEntryInfo> {
        self.queue
            .iter()
            .map(|entry| match self.queue.entry(entry) {
                QueueEntry::Marker(mask) => QueueEntryInfo {
                    entry_type: if entry == self.queue.tail_marker() {
                        "Tail-Marker".to_owned()
                    } else {
                        "Marker".to_owned()
                    },
                    name: "Marker".to_owned(),
                    bits: mask.to_string(),
                },
                QueueEntry::Update(id) => {
                    let update = self.exporter.update(id);
                    QueueEntryInfo {
                        entry_type: match update.kind() {
                            update::UpdateKind::Update => "Update".to_owned(),
                            update::UpdateKind::Delete => "Delete".to_owned(),
                        },
                        name: self.entity_name(update.target()),
                        bits: update.advertise().to_string(),
                    }
                }
            })
            .collect()
    }

    /// Registered clients with tracker sizes and counters.
    pub fn show_clients(&self) -> Vec<ClientMapEntry> {
        let mut entries: Vec<ClientMapEntry> = self
            .clients
            .iter()
            .map(|(index, info)| ClientMapEntry {
                identifier: info.client.identifier().to_owned(),
                index,
                interest_states: self.exporter.tracker_size(TrackerKind::Interest, index),
                advertised_states: self.exporter.tracker_size(TrackerKind::Advertised, index),
                is_blocked: self.sender.is_client_blocked(index),
                stats: info.stats.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.index);
        entries
    }

    pub fn show_pending_vm_regs(&self) -> Vec<PendingVmRegEntry> {
        self.vm_registry
            .pending()
            .map(|(uuid, reg)| PendingVmRegEntry {
                vm_uuid: uuid.to_owned(),
                vr_name: reg.vr_name.clone(),
            })
            .collect()
    }

    pub fn show_uuid_map(&self) -> Vec<UuidMapEntry> {
        self.vm_registry
            .uuid_map()
            .map(|(uuid, id)| UuidMapEntry {
                vm_uuid: uuid.to_owned(),
                node_name: self.graph.node(id).name().to_owned(),
            })
            .collect()
    }

    pub fn show_client_history(&self) -> Vec<ClientHistoryEntry> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn client_stats(&self, index: usize) -> Option<&ClientStats> {
        self.clients.get(index).map(|info| &info.stats)
    }

    pub fn uuid_map_size(&self) -> usize {
        self.vm_registry.uuid_map_size()
    }

    pub fn pending_vm_reg_count(&self) -> usize {
        self.vm_registry.pending_len()
    }

    /// Returns whether the queue holds nothing but the tail marker.
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Interest and advertised sets of a node's shadow state, if any.
    pub fn node_state_sets(&self, id: NodeId) -> Option<(BitSet, BitSet)> {
        self.exporter
            .node_state(id)
            .map(|state| (state.data.interest().clone(), state.data.advertised().clone()))
    }

    /// Interest and advertised sets of a link's shadow state, if any.
    pub fn link_state_sets(&self, id: LinkId) -> Option<(BitSet, BitSet)> {
        self.exporter
            .link_state(id)
            .map(|state| (state.data.interest().clone(), state.data.advertised().clone()))
    }

    fn dispatch_event(&mut self, event: GraphEvent) {
        if let GraphEvent::Node(id) = event {
            // The VM mapper listens on the same notifications.
            if let Some(uuid) =
                self.vm_registry
                    .observe_node(&self.graph, id, &self.config.vm_node_type)
            {
                self.drain_pending_vm_reg(&uuid);
            }
        }

        let handle = self.sender.handle();
        let mut ctx = ExportContext {
            graph: &mut self.graph,
            queue: &mut self.queue,
            sender: &handle,
            clients: &self.clients,
            walker: &mut self.walker,
            config: &self.config,
        };
        match event {
            GraphEvent::Node(id) => self.exporter.node_table_export(&mut ctx, id),
            GraphEvent::Link(id) => self.exporter.link_table_export(&mut ctx, id),
        }
    }

    fn drain_pending_vm_reg(&mut self, uuid: &str) {
        let Some(pending) = self.vm_registry.take_pending(uuid) else {
            return;
        };
        let Some(index) = self.clients.find_index(&pending.vr_name) else {
            return;
        };
        let Some(vm) = self.vm_registry.node_by_uuid(uuid) else {
            return;
        };
        debug!("replaying pending vm registration {uuid} for {}", pending.vr_name);
        self.stats.vm_pending_drained += 1;
        self.apply_vm_subscribe(index, vm, uuid, true);
    }

    fn apply_vm_subscribe(&mut self, index: usize, vm: NodeId, vm_uuid: &str, subscribe: bool) {
        let identifier = self
            .clients
            .identifier(index)
            .expect("subscribing client must exist")
            .to_owned();
        if subscribe {
            if let Some(info) = self.clients.get_mut(index) {
                info.vms.insert(vm_uuid.to_owned());
            }
            let anchor = self
                .graph
                .find_node(&self.config.anchor_node_type, &identifier)
                .unwrap_or_else(|| {
                    self.graph
                        .insert_node(&self.config.anchor_node_type, &identifier)
                });
            self.graph
                .insert_link(anchor, vm, &self.config.vr_vm_metadata);
            self.client_graph_download(index);
        } else {
            if let Some(info) = self.clients.get_mut(index) {
                info.vms.remove(vm_uuid);
            }
            if let Some(anchor) = self.graph.find_node(&self.config.anchor_node_type, &identifier)
            {
                if let Some(link) = self
                    .graph
                    .find_link(anchor, vm, &self.config.vr_vm_metadata)
                {
                    if !self.graph.link(link).is_deleted() {
                        self.graph.delete_link(link);
                    }
                }
            }
        }
    }

    /// Seeds the initial download: the anchor node and every white-listed
    /// link out of it are re-notified with the client's bit now present.
    fn client_graph_download(&mut self, index: usize) {
        let Some(identifier) = self.clients.identifier(index) else {
            return;
        };
        let identifier = identifier.to_owned();
        let Some(anchor) = self
            .graph
            .find_node(&self.config.anchor_node_type, &identifier)
        else {
            return;
        };
        if !self.graph.node_feasible(anchor) {
            return;
        }
        self.graph.notify_node(anchor);
        for link in self.graph.adjacent_links(anchor) {
            if self.walker.edge_allowed(&self.graph, anchor, link) {
                self.graph.notify_link(link);
            }
        }
    }

    /// Deletes the vr→vm links a terminating client's subscriptions created.
    fn remove_self_added_links(&mut self, index: usize) {
        let Some(identifier) = self.clients.identifier(index) else {
            return;
        };
        let Some(anchor) = self
            .graph
            .find_node(&self.config.anchor_node_type, identifier)
        else {
            return;
        };
        for link in self.graph.adjacent_links(anchor) {
            if self.graph.link(link).is_deleted()
                || self.graph.link(link).metadata() != self.config.vr_vm_metadata
            {
                continue;
            }
            let other = self.graph.other_endpoint(link, anchor);
            if self.graph.node(other).node_type() == self.config.vm_node_type {
                self.graph.delete_link(link);
            }
        }
    }

    fn entity_name(&self, target: StateRef) -> String {
        match target {
            StateRef::Node(id) => {
                let node = self.graph.node(id);
                format!("{}:{}", node.node_type(), node.name())
            }
            StateRef::Link(id) => {
                let (left, right) = self.graph.endpoints(id);
                format!(
                    "{}:{} -- {}:{}",
                    self.graph.node(left).node_type(),
                    self.graph.node(left).name(),
                    self.graph.node(right).node_type(),
                    self.graph.node(right).name(),
                )
            }
        }
    }
}
