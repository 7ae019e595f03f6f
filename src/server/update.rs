//! Pending per-entity diffs and the shadow state kept for every exported
//! node and link.
//!
//! An [`Update`] is referenced from two places at once: the owning state's
//! update list (at most one UPDATE and one DELETE outstanding per entity) and
//! the shared [`UpdateQueue`](super::update_queue::UpdateQueue) while it still
//! has clients to reach. Both references are arena indices, so unlinking from
//! either side is O(1).

use fnv::FnvHashSet;

use super::update_queue::EntryId;
use crate::bitset::BitSet;
use crate::graph::{LinkId, NodeId};

/// Identity of the graph entity a state or update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateRef {
    Node(NodeId),
    Link(LinkId),
}

/// Whether a pending diff announces or withdraws its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Update,
    Delete,
}

/// Handle of an [`Update`] inside the [`UpdateStore`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateId(u32);

/// One pending diff for one entity.
///
/// `advertise` is the set of clients this diff still needs to reach; it is
/// never empty while the update sits in the queue.
#[derive(Debug)]
pub struct Update {
    target: StateRef,
    kind: UpdateKind,
    advertise: BitSet,
    queue_slot: Option<EntryId>,
}

impl Update {
    pub fn new(target: StateRef, kind: UpdateKind) -> Self {
        Self {
            target,
            kind,
            advertise: BitSet::new(),
            queue_slot: None,
        }
    }

    pub fn target(&self) -> StateRef {
        self.target
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn is_delete(&self) -> bool {
        self.kind == UpdateKind::Delete
    }

    pub fn advertise(&self) -> &BitSet {
        &self.advertise
    }

    pub(crate) fn advertise_or(&mut self, set: &BitSet) {
        self.advertise |= set;
    }

    pub(crate) fn advertise_subtract(&mut self, set: &BitSet) {
        self.advertise.subtract(set);
    }

    pub(crate) fn set_advertise(&mut self, set: BitSet) {
        self.advertise = set;
    }

    pub(crate) fn queue_slot(&self) -> Option<EntryId> {
        self.queue_slot
    }

    pub(crate) fn set_queue_slot(&mut self, slot: Option<EntryId>) {
        self.queue_slot = slot;
    }
}

/// Arena holding every outstanding [`Update`].
#[derive(Debug, Default)]
pub struct UpdateStore {
    slots: Vec<Option<Update>>,
    free: Vec<UpdateId>,
}

impl UpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, update: Update) -> UpdateId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = Some(update);
                id
            }
            None => {
                let id = UpdateId(self.slots.len() as u32);
                self.slots.push(Some(update));
                id
            }
        }
    }

    /// Releases an update. The caller must already have unlinked it from the
    /// queue and from its state's update list.
    pub fn free(&mut self, id: UpdateId) -> Update {
        let update = self.slots[id.0 as usize]
            .take()
            .expect("freed update must exist");
        assert!(update.queue_slot.is_none(), "freed update still queued");
        self.free.push(id);
        update
    }

    pub fn get(&self, id: UpdateId) -> &Update {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("update must exist")
    }

    pub fn get_mut(&mut self, id: UpdateId) -> &mut Update {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("update must exist")
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The outstanding diffs of one state: at most one UPDATE and one DELETE.
#[derive(Debug, Default)]
pub struct UpdateList {
    update: Option<UpdateId>,
    delete: Option<UpdateId>,
}

impl UpdateList {
    pub fn get(&self, kind: UpdateKind) -> Option<UpdateId> {
        match kind {
            UpdateKind::Update => self.update,
            UpdateKind::Delete => self.delete,
        }
    }

    pub fn insert(&mut self, kind: UpdateKind, id: UpdateId) {
        let slot = match kind {
            UpdateKind::Update => &mut self.update,
            UpdateKind::Delete => &mut self.delete,
        };
        assert!(slot.is_none(), "one outstanding update per kind");
        *slot = Some(id);
    }

    pub fn remove(&mut self, kind: UpdateKind) -> Option<UpdateId> {
        match kind {
            UpdateKind::Update => self.update.take(),
            UpdateKind::Delete => self.delete.take(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.delete.is_none()
    }
}

/// Bookkeeping common to node and link states.
///
/// `interest` is the set of clients entitled to see the entity; `advertised`
/// the set that has received the current version. A client never sits in
/// `advertised` and in an outstanding UPDATE's advertise set at the same
/// time.
#[derive(Debug, Default)]
pub struct StateData {
    pub(crate) interest: BitSet,
    pub(crate) advertised: BitSet,
    pub(crate) update_list: UpdateList,
    pub(crate) fingerprint: u64,
    pub(crate) valid: bool,
}

impl StateData {
    pub fn interest(&self) -> &BitSet {
        &self.interest
    }

    pub fn advertised(&self) -> &BitSet {
        &self.advertised
    }

    pub fn update_list(&self) -> &UpdateList {
        &self.update_list
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Per-node shadow record.
#[derive(Debug, Default)]
pub struct NodeState {
    pub(crate) data: StateData,
    /// Links that depend on this node staying alive.
    pub(crate) dependents: FnvHashSet<LinkId>,
    /// Scratch interest recomputed by the graph walker after link removals.
    pub(crate) nmask: BitSet,
}

impl NodeState {
    pub fn has_dependents(&self) -> bool {
        !self.dependents.is_empty()
    }

    /// A node state may only go away once the entity is deleted and nothing
    /// refers to it anymore.
    pub fn can_delete(&self) -> bool {
        !self.data.valid && self.data.update_list.is_empty() && self.dependents.is_empty()
    }
}

/// Per-link shadow record.
///
/// While valid, the link holds its endpoints' node states alive through the
/// endpoint back-reference; the endpoints' `dependents` sets mirror it.
#[derive(Debug, Default)]
pub struct LinkState {
    pub(crate) data: StateData,
    pub(crate) endpoints: Option<(NodeId, NodeId)>,
}

impl LinkState {
    pub fn has_dependency(&self) -> bool {
        self.endpoints.is_some()
    }

    pub fn can_delete(&self) -> bool {
        !self.data.valid && self.data.update_list.is_empty()
    }
}
