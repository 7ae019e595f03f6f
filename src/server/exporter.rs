//! Turns graph change notifications into per-client diffs on the queue.
//!
//! The exporter listens on every node and link notification, keeps the
//! shadow state (interest, advertised, pending diffs) for each entity, and
//! enforces the wire ordering rules: a node is announced before any link
//! referring to it, and links are withdrawn before either of their endpoint
//! nodes. It delegates reachability to the [`GraphWalker`] and delivery to
//! the [`UpdateSender`](super::update_sender::UpdateSender).

use std::hash::Hasher;

use fnv::{FnvHashMap, FnvHashSet, FnvHasher};
use log::{debug, trace};

use super::ServerConfig;
use super::client::ClientRegistry;
use super::graph_walker::GraphWalker;
use super::update::{
    LinkState, NodeState, StateData, StateRef, Update, UpdateId, UpdateKind, UpdateStore,
};
use super::update_queue::UpdateQueue;
use super::update_sender::SenderHandle;
use crate::bitset::BitSet;
use crate::graph::{Graph, LinkId, NodeId};

/// Which per-client secondary index a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Interest,
    Advertised,
}

/// Everything a notification handler may touch besides the exporter itself.
///
/// The server assembles this from its sibling components for the duration of
/// one dispatch; handlers recurse with the same context.
pub(crate) struct ExportContext<'a> {
    pub graph: &'a mut Graph,
    pub queue: &'a mut UpdateQueue,
    pub sender: &'a SenderHandle,
    pub clients: &'a ClientRegistry,
    pub walker: &'a mut GraphWalker,
    pub config: &'a ServerConfig,
}

#[derive(Default)]
pub struct Exporter {
    node_states: FnvHashMap<NodeId, NodeState>,
    link_states: FnvHashMap<LinkId, LinkState>,
    updates: UpdateStore,
    /// Per-client set of states whose interest contains the client's bit.
    interest_tracker: Vec<Option<FnvHashSet<StateRef>>>,
    /// Per-client set of states whose advertised contains the client's bit.
    advertised_tracker: Vec<Option<FnvHashSet<StateRef>>>,
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a node table notification.
    pub(crate) fn node_table_export(&mut self, ctx: &mut ExportContext<'_>, id: NodeId) {
        if !ctx.graph.contains_node(id) {
            // Stale notification for an already reclaimed entry.
            return;
        }
        if ctx.graph.node_feasible(id) {
            self.node_state_locate(id).data.valid = true;
            let interest = self.merge_client_interest(ctx, id);

            let state = &self.node_states[&id];
            // Add for clients that are interested and have not seen the
            // advertisement; remove for clients that have seen it but are no
            // longer interested.
            let add_set = interest.difference(&state.data.advertised);
            let rm_set = state.data.advertised.difference(&interest);
            let changed = self.config_changed(ctx.graph, id);
            trace!(
                "node export {}: add {} rm {} changed {changed}",
                ctx.graph.node(id).name(),
                add_set.to_numbered_string(),
                rm_set.to_numbered_string(),
            );

            // If a pending update has already been seen by some receiver it
            // moves to the tail, and dependent link updates move with it.
            let moved = self.update_add_change(ctx, StateRef::Node(id), &add_set, &rm_set, changed);
            if moved {
                self.move_dependent_links(ctx, id);
            }

            // Withdraw dependent links first for the clients losing the node.
            if !rm_set.is_empty() {
                self.remove_dependent_links(ctx, id, &rm_set);
            }
            self.update_remove(ctx, StateRef::Node(id), &rm_set);
        } else if self.node_states.contains_key(&id) {
            self.config_changed(ctx.graph, id);
            let state = self.node_states.get_mut(&id).expect("state checked above");
            state.data.valid = false;
            // Link deletes must precede the node delete; wait for dependents.
            if !state.has_dependents() {
                let interest = state.data.interest.clone();
                self.state_interest_reset(StateRef::Node(id), &interest);
                self.enqueue_delete(ctx, StateRef::Node(id));
                if self.node_states[&id].data.update_list.is_empty() {
                    self.delete_state_if_appropriate(StateRef::Node(id), ctx.graph);
                }
            }
        } else if ctx.graph.node(id).is_deleted() && ctx.graph.adjacent_links(id).is_empty() {
            // Deleted before it was ever exported.
            ctx.graph.purge_node(id);
        }
    }

    /// Handles a link table notification.
    pub(crate) fn link_table_export(&mut self, ctx: &mut ExportContext<'_>, id: LinkId) {
        if !ctx.graph.contains_link(id) {
            return;
        }
        if !ctx.graph.link(id).is_deleted() {
            self.link_export_feasible(ctx, id);
        } else {
            self.link_export_deleted(ctx, id);
        }
    }

    fn link_export_feasible(&mut self, ctx: &mut ExportContext<'_>, id: LinkId) {
        let (left, right) = ctx.graph.endpoints(id);

        let existing = self
            .link_states
            .get(&id)
            .map(|state| (state.data.is_valid(), state.has_dependency()));
        let add_link = match existing {
            None => {
                self.link_states.insert(id, LinkState::default());
                true
            }
            // Link change.
            Some((true, has_dependency)) => {
                assert!(has_dependency);
                false
            }
            // Revival: delete quickly followed by add.
            Some((false, has_dependency)) => {
                assert!(!has_dependency);
                true
            }
        };
        if add_link {
            self.node_state_locate(left);
            self.node_state_locate(right);
        }

        // If an endpoint is an anchor node, its own client's bit joins the
        // interest before anything else is computed.
        let lset = self.merge_client_interest(ctx, left);
        let rset = self.merge_client_interest(ctx, right);
        if lset != rset {
            ctx.walker.link_add(ctx.graph, id, &lset, &rset);
        }

        if add_link {
            let state = self.link_states.get_mut(&id).expect("state created above");
            state.endpoints = Some((left, right));
            state.data.valid = true;
            self.node_states
                .get_mut(&left)
                .expect("endpoint state located above")
                .dependents
                .insert(id);
            self.node_states
                .get_mut(&right)
                .expect("endpoint state located above")
                .dependents
                .insert(id);
        }

        // A link is visible exactly to clients that see both endpoints.
        let interest = if ctx.graph.node_feasible(left) && ctx.graph.node_feasible(right) {
            &self.node_states[&left].data.interest & &self.node_states[&right].data.interest
        } else {
            BitSet::new()
        };
        self.state_interest_set(StateRef::Link(id), interest);

        let state = &self.link_states[&id];
        let add_set = state.data.interest.difference(&state.data.advertised);
        let rm_set = state.data.advertised.difference(&state.data.interest);

        // Every client gaining the link must have both endpoint nodes first.
        if !add_set.is_empty() {
            self.process_adjacent_node(ctx, left, &add_set);
            self.process_adjacent_node(ctx, right, &add_set);
        }

        self.update_add_change(ctx, StateRef::Link(id), &add_set, &rm_set, false);
        let moved = self.update_remove(ctx, StateRef::Link(id), &rm_set);
        if moved {
            // A moved link withdrawal drags the endpoint node withdrawals
            // behind it, keeping "links die first" intact.
            self.move_adjacent_node(ctx, left);
            self.move_adjacent_node(ctx, right);
        }
    }

    fn link_export_deleted(&mut self, ctx: &mut ExportContext<'_>, id: LinkId) {
        let Some(state) = self.link_states.get(&id) else {
            // Deleted before it was ever exported.
            let endpoints = ctx.graph.endpoints(id);
            ctx.graph.purge_link(id);
            self.reclaim_orphan_endpoints(ctx.graph, endpoints);
            return;
        };
        if !state.data.is_valid() {
            return;
        }
        let (left, right) = state.endpoints.expect("valid link state has endpoints");

        let invalidated =
            &self.node_states[&left].data.interest & &self.node_states[&right].data.interest;
        let own_interest = self.link_states[&id].data.interest.clone();
        self.state_interest_reset(StateRef::Link(id), &own_interest);
        debug!(
            "link remove {} between {} and {}, recompute for {}",
            ctx.graph.link(id).metadata(),
            ctx.graph.node(left).name(),
            ctx.graph.node(right).name(),
            invalidated.to_numbered_string(),
        );
        ctx.walker.link_remove(&invalidated);

        let state = self.link_states.get_mut(&id).expect("state checked above");
        state.endpoints = None;
        state.data.valid = false;
        for endpoint in [left, right] {
            self.node_states
                .get_mut(&endpoint)
                .expect("endpoint state outlives the link")
                .dependents
                .remove(&id);
        }

        self.enqueue_delete(ctx, StateRef::Link(id));
        if self.link_states[&id].data.update_list.is_empty() {
            self.delete_state_if_appropriate(StateRef::Link(id), ctx.graph);
        }

        self.maybe_notify_on_link_delete(ctx.graph, left);
        self.maybe_notify_on_link_delete(ctx.graph, right);
    }

    /// Bookkeeping run when the sender (or queue cleanup) peels a client set
    /// off an update.
    ///
    /// For an announcement the set has now seen the entity; for a withdrawal
    /// it no longer has it. When nobody is left to reach, the update is
    /// released, and a fully withdrawn entity loses its state.
    pub(crate) fn state_update_on_dequeue(
        &mut self,
        id: UpdateId,
        dequeue_set: &BitSet,
        is_delete: bool,
        graph: &mut Graph,
    ) {
        let update = self.updates.get(id);
        let target = update.target();
        let advertise_empty = update.advertise().is_empty();

        if is_delete {
            // Queue cleanup passes UPDATE entries through here too; reset
            // only the bits that are actually advertised.
            let advertised = &self.state_data(target).advertised;
            let adv_bits = advertised & dequeue_set;
            self.state_advertised_reset(target, &adv_bits);
        } else {
            self.state_advertised_or(target, dequeue_set);
        }

        if advertise_empty {
            let kind = self.updates.get(id).kind();
            let removed = self.state_data_mut(target).update_list.remove(kind);
            assert_eq!(removed, Some(id), "update must be on its state's list");
            self.updates.free(id);
            if kind == UpdateKind::Delete {
                self.delete_state_if_appropriate(target, graph);
            }
        }
    }

    pub(crate) fn add_client_tracker(&mut self, index: usize) {
        for tracker in [&mut self.interest_tracker, &mut self.advertised_tracker] {
            if index >= tracker.len() {
                tracker.resize_with(index + 1, || None);
            }
            assert!(tracker[index].is_none(), "client tracker already present");
            tracker[index] = Some(FnvHashSet::default());
        }
    }

    pub(crate) fn delete_client_tracker(&mut self, index: usize) {
        for tracker in [&mut self.interest_tracker, &mut self.advertised_tracker] {
            tracker[index].take().expect("client tracker must exist");
        }
    }

    /// Clears the client's bit from every state it is tracked in. This is the
    /// fast bulk cleanup on unregister; it avoids a full table scan.
    pub(crate) fn cleanup_client_tracked(&mut self, index: usize) {
        let rm = BitSet::single(index);
        let tracked: Vec<StateRef> = self.interest_tracker[index]
            .as_ref()
            .expect("client tracker must exist")
            .iter()
            .copied()
            .collect();
        for target in tracked {
            self.state_interest_reset(target, &rm);
        }
        let tracked: Vec<StateRef> = self.advertised_tracker[index]
            .as_ref()
            .expect("client tracker must exist")
            .iter()
            .copied()
            .collect();
        for target in tracked {
            self.state_advertised_reset(target, &rm);
        }
    }

    pub(crate) fn tracker_states(
        &self,
        kind: TrackerKind,
        index: usize,
    ) -> Option<&FnvHashSet<StateRef>> {
        let tracker = match kind {
            TrackerKind::Interest => &self.interest_tracker,
            TrackerKind::Advertised => &self.advertised_tracker,
        };
        tracker.get(index).and_then(|set| set.as_ref())
    }

    pub(crate) fn tracker_size(&self, kind: TrackerKind, index: usize) -> usize {
        self.tracker_states(kind, index).map_or(0, |set| set.len())
    }

    pub(crate) fn node_state(&self, id: NodeId) -> Option<&NodeState> {
        self.node_states.get(&id)
    }

    pub(crate) fn node_state_mut(&mut self, id: NodeId) -> Option<&mut NodeState> {
        self.node_states.get_mut(&id)
    }

    pub(crate) fn node_state_locate(&mut self, id: NodeId) -> &mut NodeState {
        self.node_states.entry(id).or_default()
    }

    pub(crate) fn link_state(&self, id: LinkId) -> Option<&LinkState> {
        self.link_states.get(&id)
    }

    pub(crate) fn update(&self, id: UpdateId) -> &Update {
        self.updates.get(id)
    }

    pub(crate) fn update_mut(&mut self, id: UpdateId) -> &mut Update {
        self.updates.get_mut(id)
    }

    pub(crate) fn updates_mut(&mut self) -> &mut UpdateStore {
        &mut self.updates
    }

    pub(crate) fn state_data(&self, target: StateRef) -> &StateData {
        match target {
            StateRef::Node(id) => &self.node_states[&id].data,
            StateRef::Link(id) => &self.link_states[&id].data,
        }
    }

    fn state_data_mut(&mut self, target: StateRef) -> &mut StateData {
        match target {
            StateRef::Node(id) => {
                &mut self
                    .node_states
                    .get_mut(&id)
                    .expect("node state must exist")
                    .data
            }
            StateRef::Link(id) => {
                &mut self
                    .link_states
                    .get_mut(&id)
                    .expect("link state must exist")
                    .data
            }
        }
    }

    /// Replaces a state's interest, keeping the per-client trackers current.
    pub(crate) fn state_interest_set(&mut self, target: StateRef, interest: BitSet) {
        let current = &self.state_data(target).interest;
        let added = interest.difference(current);
        let removed = current.difference(&interest);
        update_tracker(&mut self.interest_tracker, target, &added, true);
        update_tracker(&mut self.interest_tracker, target, &removed, false);
        self.state_data_mut(target).interest = interest;
    }

    pub(crate) fn state_interest_or(&mut self, target: StateRef, bits: &BitSet) {
        update_tracker(&mut self.interest_tracker, target, bits, true);
        self.state_data_mut(target).interest |= bits;
    }

    pub(crate) fn state_interest_reset(&mut self, target: StateRef, bits: &BitSet) {
        let present = &self.state_data(target).interest & bits;
        update_tracker(&mut self.interest_tracker, target, &present, false);
        self.state_data_mut(target).interest.subtract(bits);
    }

    pub(crate) fn state_advertised_or(&mut self, target: StateRef, bits: &BitSet) {
        update_tracker(&mut self.advertised_tracker, target, bits, true);
        self.state_data_mut(target).advertised |= bits;
    }

    pub(crate) fn state_advertised_reset(&mut self, target: StateRef, bits: &BitSet) {
        let present = &self.state_data(target).advertised & bits;
        update_tracker(&mut self.advertised_tracker, target, &present, false);
        self.state_data_mut(target).advertised.subtract(bits);
    }

    /// For anchor nodes, merges the owning client's bit into the interest
    /// before add/remove sets are computed. Returns the effective interest.
    fn merge_client_interest(&mut self, ctx: &ExportContext<'_>, id: NodeId) -> BitSet {
        let node = ctx.graph.node(id);
        if node.node_type() == ctx.config.anchor_node_type {
            if let Some(bit) = ctx.clients.find_index(node.name()) {
                if !self.node_states[&id].data.interest.test(bit) {
                    self.state_interest_or(StateRef::Node(id), &BitSet::single(bit));
                }
            }
        }
        self.node_states[&id].data.interest.clone()
    }

    /// Creates or refreshes the pending UPDATE for a state.
    ///
    /// Returns whether an existing entry was moved to the tail, which
    /// requires dependent entries to move as well.
    fn update_add_change(
        &mut self,
        ctx: &mut ExportContext<'_>,
        target: StateRef,
        add_set: &BitSet,
        rm_set: &BitSet,
        change: bool,
    ) -> bool {
        let Self {
            node_states,
            link_states,
            updates,
            ..
        } = self;
        let data = state_data_split(node_states, link_states, target);

        let existing = data.update_list.get(UpdateKind::Update);
        if let Some(id) = existing {
            updates.get_mut(id).advertise_subtract(rm_set);
        }

        if data.interest.is_empty() {
            // Nobody is entitled anymore; cancel the pending announcement.
            if let Some(id) = existing {
                ctx.queue.dequeue(id, updates);
                data.update_list.remove(UpdateKind::Update);
                updates.free(id);
            }
            return false;
        }

        if !change && add_set.is_empty() {
            return false;
        }

        let mut moved = false;
        let id = match existing {
            Some(id) => {
                if !change {
                    if updates.get(id).advertise().contains(add_set) {
                        return false;
                    }
                } else if data.interest == *updates.get(id).advertise() {
                    return false;
                }
                moved = true;
                ctx.queue.dequeue(id, updates);
                id
            }
            None => {
                let id = updates.alloc(Update::new(target, UpdateKind::Update));
                data.update_list.insert(UpdateKind::Update, id);
                id
            }
        };

        if change {
            // New content goes to every interested client, seen or not.
            let interest = data.interest.clone();
            updates.get_mut(id).set_advertise(interest);
        } else {
            updates.get_mut(id).advertise_or(add_set);
        }
        ctx.queue.enqueue(id, updates);
        ctx.sender.queue_active();
        moved
    }

    /// Creates or refreshes the pending DELETE covering `rm_set`.
    fn update_remove(
        &mut self,
        ctx: &mut ExportContext<'_>,
        target: StateRef,
        rm_set: &BitSet,
    ) -> bool {
        let Self {
            node_states,
            link_states,
            updates,
            ..
        } = self;
        let data = state_data_split(node_states, link_states, target);

        let existing = data.update_list.get(UpdateKind::Delete);
        if let Some(id) = existing {
            // Clients that regained interest must not see the withdrawal.
            let interest = data.interest.clone();
            updates.get_mut(id).advertise_subtract(&interest);
        }

        if rm_set.is_empty() {
            if let Some(id) = existing {
                ctx.queue.dequeue(id, updates);
                data.update_list.remove(UpdateKind::Delete);
                updates.free(id);
            }
            return false;
        }

        let mut moved = false;
        let id = match existing {
            Some(id) => {
                if *updates.get(id).advertise() == *rm_set {
                    return false;
                }
                moved = true;
                ctx.queue.dequeue(id, updates);
                id
            }
            None => {
                let id = updates.alloc(Update::new(target, UpdateKind::Delete));
                data.update_list.insert(UpdateKind::Delete, id);
                id
            }
        };

        updates.get_mut(id).set_advertise(rm_set.clone());
        ctx.queue.enqueue(id, updates);
        ctx.sender.queue_active();
        moved
    }

    /// Withdraws a deleted entity from everyone it was advertised to.
    fn enqueue_delete(&mut self, ctx: &mut ExportContext<'_>, target: StateRef) {
        let Self {
            node_states,
            link_states,
            updates,
            ..
        } = self;
        let data = state_data_split(node_states, link_states, target);

        if let Some(id) = data.update_list.remove(UpdateKind::Update) {
            ctx.queue.dequeue(id, updates);
            updates.free(id);
        }

        let existing = data.update_list.get(UpdateKind::Delete);
        if let Some(id) = existing {
            ctx.queue.dequeue(id, updates);
        }
        if data.advertised.is_empty() {
            assert!(existing.is_none(), "withdrawal pending with nothing advertised");
            return;
        }

        let id = existing.unwrap_or_else(|| {
            let id = updates.alloc(Update::new(target, UpdateKind::Delete));
            data.update_list.insert(UpdateKind::Delete, id);
            id
        });
        let advertised = data.advertised.clone();
        updates.get_mut(id).set_advertise(advertised);
        ctx.queue.enqueue(id, updates);
        ctx.sender.queue_active();
    }

    /// Re-enqueues the pending UPDATE of every dependent link behind a moved
    /// node announcement.
    fn move_dependent_links(&mut self, ctx: &mut ExportContext<'_>, id: NodeId) {
        let dependents: Vec<LinkId> = self.node_states[&id].dependents.iter().copied().collect();
        for link in dependents {
            let Some(state) = self.link_states.get(&link) else {
                continue;
            };
            let Some(update) = state.data.update_list.get(UpdateKind::Update) else {
                continue;
            };
            assert!(!self.updates.get(update).advertise().is_empty());
            ctx.queue.dequeue(update, &mut self.updates);
            ctx.queue.enqueue(update, &mut self.updates);
            ctx.sender.queue_active();
        }
    }

    /// Re-enqueues a node's pending DELETE behind a moved link withdrawal.
    fn move_adjacent_node(&mut self, ctx: &mut ExportContext<'_>, id: NodeId) {
        let Some(state) = self.node_states.get(&id) else {
            return;
        };
        if let Some(update) = state.data.update_list.get(UpdateKind::Delete) {
            assert!(!self.updates.get(update).advertise().is_empty());
            ctx.queue.dequeue(update, &mut self.updates);
            ctx.queue.enqueue(update, &mut self.updates);
            ctx.sender.queue_active();
        }
    }

    /// Withdraws dependent links from clients in `rm_set` ahead of the node
    /// itself.
    fn remove_dependent_links(&mut self, ctx: &mut ExportContext<'_>, id: NodeId, rm_set: &BitSet) {
        let dependents: Vec<LinkId> = self.node_states[&id].dependents.iter().copied().collect();
        for link in dependents {
            let Some(state) = self.link_states.get(&link) else {
                continue;
            };
            if state.data.advertised.intersects(rm_set) {
                self.link_table_export(ctx, link);
            }
        }
    }

    /// Forces a node announcement for clients about to receive a link to it.
    fn process_adjacent_node(&mut self, ctx: &mut ExportContext<'_>, id: NodeId, add_set: &BitSet) {
        let state = &self.node_states[&id];
        let mut covered = state.data.advertised.clone();
        if let Some(update) = state.data.update_list.get(UpdateKind::Update) {
            covered |= self.updates.get(update).advertise();
        }
        if !covered.contains(add_set) {
            self.node_table_export(ctx, id);
        }
    }

    fn maybe_notify_on_link_delete(&self, graph: &mut Graph, id: NodeId) {
        if !graph.node(id).is_deleted() {
            return;
        }
        match self.node_states.get(&id) {
            Some(state) if state.has_dependents() => (),
            // The last link is gone; the node delete can proceed now.
            _ => graph.notify_node(id),
        }
    }

    fn delete_state_if_appropriate(&mut self, target: StateRef, graph: &mut Graph) {
        match target {
            StateRef::Node(id) => {
                let Some(state) = self.node_states.get(&id) else {
                    return;
                };
                if !state.can_delete() {
                    return;
                }
                assert!(state.data.interest.is_empty());
                assert!(state.data.advertised.is_empty());
                self.node_states.remove(&id);
                if graph.contains_node(id)
                    && graph.node(id).is_deleted()
                    && graph.adjacent_links(id).is_empty()
                {
                    graph.purge_node(id);
                }
            }
            StateRef::Link(id) => {
                let Some(state) = self.link_states.get(&id) else {
                    return;
                };
                if !state.can_delete() {
                    return;
                }
                assert!(state.data.interest.is_empty());
                assert!(state.data.advertised.is_empty());
                self.link_states.remove(&id);
                if graph.contains_link(id) && graph.link(id).is_deleted() {
                    let endpoints = graph.endpoints(id);
                    graph.purge_link(id);
                    self.reclaim_orphan_endpoints(graph, endpoints);
                }
            }
        }
    }

    /// Reclaims deleted, never-exported endpoint nodes once their last link
    /// is gone. Exported endpoints go through their own delete notification
    /// instead.
    fn reclaim_orphan_endpoints(&self, graph: &mut Graph, endpoints: (NodeId, NodeId)) {
        for id in [endpoints.0, endpoints.1] {
            if graph.contains_node(id)
                && graph.node(id).is_deleted()
                && !self.node_states.contains_key(&id)
                && graph.adjacent_links(id).is_empty()
            {
                graph.purge_node(id);
            }
        }
    }

    /// Compares the node's config fingerprint against the stored one,
    /// refreshing it on change.
    fn config_changed(&mut self, graph: &Graph, id: NodeId) -> bool {
        let fingerprint = config_fingerprint(graph.node(id).config());
        let state = self.node_states.get_mut(&id).expect("node state must exist");
        if state.data.fingerprint == fingerprint {
            false
        } else {
            state.data.fingerprint = fingerprint;
            true
        }
    }
}

fn state_data_split<'a>(
    node_states: &'a mut FnvHashMap<NodeId, NodeState>,
    link_states: &'a mut FnvHashMap<LinkId, LinkState>,
    target: StateRef,
) -> &'a mut StateData {
    match target {
        StateRef::Node(id) => {
            &mut node_states
                .get_mut(&id)
                .expect("node state must exist")
                .data
        }
        StateRef::Link(id) => {
            &mut link_states
                .get_mut(&id)
                .expect("link state must exist")
                .data
        }
    }
}

fn update_tracker(
    tracker: &mut [Option<FnvHashSet<StateRef>>],
    target: StateRef,
    bits: &BitSet,
    add: bool,
) {
    for bit in bits.ones() {
        let set = tracker
            .get_mut(bit)
            .and_then(|set| set.as_mut())
            .expect("client tracker must exist");
        if add {
            set.insert(target);
        } else {
            assert!(set.remove(&target), "tracked state missing from client set");
        }
    }
}

fn config_fingerprint(config: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(config);
    hasher.finish()
}
