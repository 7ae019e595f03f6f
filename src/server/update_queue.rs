//! The shared ordered list of pending updates and client position markers.
//!
//! There is exactly one queue per server. Its elements are either pending
//! [`Update`](super::update::Update)s or markers: bookmarks carrying the set
//! of clients whose streaming position is at that point. The tail marker
//! always exists and is never removed; clients that keep up all sit in it.
//! The queue is a pure ordered structure, it never delivers anything itself.
//!
//! Slots live in an arena and link to their neighbors by index, which gives
//! every entry O(1) unlink without intrusive hooks.

use fnv::FnvHashMap;
use log::trace;

use super::exporter::Exporter;
use super::update::{UpdateId, UpdateStore};
use crate::bitset::BitSet;
use crate::graph::Graph;

/// Handle of a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

/// The tail marker's slot, allocated at construction.
const TAIL_MARKER: EntryId = EntryId(0);

#[derive(Debug)]
enum SlotData {
    Free,
    Update(UpdateId),
    Marker(BitSet),
}

#[derive(Debug)]
struct Slot {
    prev: Option<EntryId>,
    next: Option<EntryId>,
    data: SlotData,
}

/// Read-only view of a queue element.
#[derive(Debug)]
pub enum QueueEntry<'a> {
    Update(UpdateId),
    Marker(&'a BitSet),
}

#[derive(Debug)]
pub struct UpdateQueue {
    slots: Vec<Slot>,
    free: Vec<EntryId>,
    head: EntryId,
    tail: EntryId,
    len: usize,
    /// Client index to the marker currently containing that client.
    marker_map: FnvHashMap<usize, EntryId>,
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self {
            slots: vec![Slot {
                prev: None,
                next: None,
                data: SlotData::Marker(BitSet::new()),
            }],
            free: Vec::new(),
            head: TAIL_MARKER,
            tail: TAIL_MARKER,
            len: 1,
            marker_map: FnvHashMap::default(),
        }
    }
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an update at the tail of the queue.
    ///
    /// Returns whether the tail marker was the last element, which tells the
    /// caller the sender has caught up and needs a nudge.
    pub fn enqueue(&mut self, id: UpdateId, updates: &mut UpdateStore) -> bool {
        assert!(
            !updates.get(id).advertise().is_empty(),
            "enqueued update must advertise at least one client"
        );
        let tail_marker_last = self.last() == self.tail_marker();
        let slot = self.alloc(SlotData::Update(id));
        self.link_after(slot, self.tail);
        updates.get_mut(id).set_queue_slot(Some(slot));
        tail_marker_last
    }

    /// Unlinks an update from the queue in O(1).
    pub fn dequeue(&mut self, id: UpdateId, updates: &mut UpdateStore) {
        let slot = updates
            .get_mut(id)
            .queue_slot()
            .expect("dequeued update must be queued");
        updates.get_mut(id).set_queue_slot(None);
        self.unlink(slot);
        self.release(slot);
    }

    /// Returns the element after `entry`, if any.
    pub fn next(&self, entry: EntryId) -> Option<EntryId> {
        self.slots[entry.0 as usize].next
    }

    /// Returns the element before `entry`, if any.
    pub fn previous(&self, entry: EntryId) -> Option<EntryId> {
        self.slots[entry.0 as usize].prev
    }

    /// Returns the last element. The queue is never empty: the tail marker is
    /// always present.
    pub fn last(&self) -> EntryId {
        self.tail
    }

    pub fn tail_marker(&self) -> EntryId {
        TAIL_MARKER
    }

    pub fn entry(&self, id: EntryId) -> QueueEntry<'_> {
        match &self.slots[id.0 as usize].data {
            SlotData::Update(update) => QueueEntry::Update(*update),
            SlotData::Marker(mask) => QueueEntry::Marker(mask),
            SlotData::Free => unreachable!("queue entry points at a free slot"),
        }
    }

    pub fn is_marker(&self, id: EntryId) -> bool {
        matches!(self.slots[id.0 as usize].data, SlotData::Marker(_))
    }

    /// Returns a marker's client set.
    pub fn marker_mask(&self, id: EntryId) -> &BitSet {
        match &self.slots[id.0 as usize].data {
            SlotData::Marker(mask) => mask,
            _ => panic!("entry is not a marker"),
        }
    }

    /// Returns the marker containing the given client.
    pub fn get_marker(&self, bit: usize) -> Option<EntryId> {
        self.marker_map.get(&bit).copied()
    }

    /// Adds a newly registered client to the tail marker so it receives new
    /// updates from here on.
    pub fn join(&mut self, bit: usize) {
        self.marker_mask_mut(TAIL_MARKER).set(bit);
        let previous = self.marker_map.insert(bit, TAIL_MARKER);
        assert!(previous.is_none(), "client already joined");
    }

    /// Removes a terminated client from every queue entry.
    ///
    /// Walks forward from the client's marker clearing its bit from each
    /// update; updates left with nobody to reach are dequeued, with the
    /// exporter bookkeeping run inline so states can advance. Finally drops
    /// the bit from its marker, removing the marker when it becomes empty
    /// (the tail marker always stays).
    pub fn leave(&mut self, bit: usize, exporter: &mut Exporter, graph: &mut Graph) {
        let marker = self
            .marker_map
            .remove(&bit)
            .expect("leaving client must have a marker");
        let reset = BitSet::single(bit);

        let mut cursor = self.next(marker);
        while let Some(entry) = cursor {
            cursor = self.next(entry);
            let SlotData::Update(id) = self.slots[entry.0 as usize].data else {
                continue;
            };
            let update = exporter.update_mut(id);
            update.advertise_subtract(&reset);
            if update.advertise().is_empty() {
                self.dequeue(id, exporter.updates_mut());
            }
            // The update may be released here.
            exporter.state_update_on_dequeue(id, &reset, true, graph);
        }

        self.marker_mask_mut(marker).reset(bit);
        if marker != TAIL_MARKER && self.marker_mask(marker).is_empty() {
            self.unlink(marker);
            self.release(marker);
        }
    }

    /// Extracts `split` out of `marker` into a new marker inserted
    /// immediately before `pivot`. Returns the new marker.
    pub fn marker_split_before(
        &mut self,
        marker: EntryId,
        pivot: EntryId,
        split: &BitSet,
    ) -> EntryId {
        self.marker_split(marker, pivot, split, true)
    }

    /// Same as [`marker_split_before`](Self::marker_split_before), inserting
    /// after `pivot` instead.
    pub fn marker_split_after(
        &mut self,
        marker: EntryId,
        pivot: EntryId,
        split: &BitSet,
    ) -> EntryId {
        self.marker_split(marker, pivot, split, false)
    }

    /// Moves `mmove` from `src` into `dst`, repointing the affected clients.
    /// An emptied `src` is removed; it must not be the tail marker.
    pub fn marker_merge(&mut self, dst: EntryId, src: EntryId, mmove: &BitSet) {
        trace!(
            "marker merge {} from {src:?} into {dst:?}",
            mmove.to_numbered_string()
        );
        *self.marker_mask_mut(dst) |= mmove;
        for bit in mmove.ones() {
            let slot = self
                .marker_map
                .get_mut(&bit)
                .expect("moved client must have a marker");
            *slot = dst;
        }
        self.marker_mask_mut(src).subtract(mmove);
        if self.marker_mask(src).is_empty() {
            assert!(src != TAIL_MARKER, "tail marker may never be removed");
            self.unlink(src);
            self.release(src);
        }
    }

    /// Re-inserts `marker` immediately before `pivot`.
    pub fn move_marker_before(&mut self, marker: EntryId, pivot: EntryId) {
        if marker != pivot {
            self.unlink(marker);
            self.link_before(marker, pivot);
        }
    }

    /// Re-inserts `marker` immediately after `pivot`.
    pub fn move_marker_after(&mut self, marker: EntryId, pivot: EntryId) {
        if marker != pivot {
            self.unlink(marker);
            self.link_after(marker, pivot);
        }
    }

    /// Returns whether the queue holds nothing but the tail marker.
    pub fn is_empty(&self) -> bool {
        self.len == 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Iterates over all entries, head to tail.
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        let mut cursor = Some(self.head);
        std::iter::from_fn(move || {
            let entry = cursor?;
            cursor = self.next(entry);
            Some(entry)
        })
    }

    fn marker_split(
        &mut self,
        marker: EntryId,
        pivot: EntryId,
        split: &BitSet,
        before: bool,
    ) -> EntryId {
        assert!(!split.is_empty(), "marker split set must not be empty");
        let mask = self.marker_mask_mut(marker);
        assert!(mask.contains(split), "split set must come from the marker");
        mask.subtract(split);
        assert!(!mask.is_empty(), "marker split must leave members behind");

        let new_marker = self.alloc(SlotData::Marker(split.clone()));
        for bit in split.ones() {
            let slot = self
                .marker_map
                .get_mut(&bit)
                .expect("split client must have a marker");
            *slot = new_marker;
        }
        if before {
            self.link_before(new_marker, pivot);
        } else {
            self.link_after(new_marker, pivot);
        }
        new_marker
    }

    fn marker_mask_mut(&mut self, id: EntryId) -> &mut BitSet {
        match &mut self.slots[id.0 as usize].data {
            SlotData::Marker(mask) => mask,
            _ => panic!("entry is not a marker"),
        }
    }

    fn alloc(&mut self, data: SlotData) -> EntryId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize].data = data;
                id
            }
            None => {
                let id = EntryId(self.slots.len() as u32);
                self.slots.push(Slot {
                    prev: None,
                    next: None,
                    data,
                });
                id
            }
        }
    }

    fn release(&mut self, id: EntryId) {
        self.slots[id.0 as usize].data = SlotData::Free;
        self.free.push(id);
    }

    fn link_before(&mut self, id: EntryId, pivot: EntryId) {
        let prev = self.slots[pivot.0 as usize].prev;
        self.slots[id.0 as usize].prev = prev;
        self.slots[id.0 as usize].next = Some(pivot);
        self.slots[pivot.0 as usize].prev = Some(id);
        match prev {
            Some(prev) => self.slots[prev.0 as usize].next = Some(id),
            None => self.head = id,
        }
        self.len += 1;
    }

    fn link_after(&mut self, id: EntryId, pivot: EntryId) {
        let next = self.slots[pivot.0 as usize].next;
        self.slots[id.0 as usize].next = next;
        self.slots[id.0 as usize].prev = Some(pivot);
        self.slots[pivot.0 as usize].next = Some(id);
        match next {
            Some(next) => self.slots[next.0 as usize].prev = Some(id),
            None => self.tail = id,
        }
        self.len += 1;
    }

    fn unlink(&mut self, id: EntryId) {
        let slot = &mut self.slots[id.0 as usize];
        let prev = slot.prev.take();
        let next = slot.next.take();
        match prev {
            Some(prev) => self.slots[prev.0 as usize].next = next,
            None => self.head = next.expect("queue never fully empties"),
        }
        match next {
            Some(next) => self.slots[next.0 as usize].prev = prev,
            None => self.tail = prev.expect("queue never fully empties"),
        }
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;
    use crate::server::update::{StateRef, Update, UpdateKind};

    fn make_update(store: &mut UpdateStore, bits: &[usize]) -> UpdateId {
        let id = store.alloc(Update::new(
            StateRef::Node(NodeId::new(0)),
            UpdateKind::Update,
        ));
        let mut advertise = BitSet::new();
        for &bit in bits {
            advertise.set(bit);
        }
        store.get_mut(id).set_advertise(advertise);
        id
    }

    fn layout(queue: &UpdateQueue) -> Vec<String> {
        queue
            .iter()
            .map(|entry| match queue.entry(entry) {
                QueueEntry::Update(_) => "U".to_owned(),
                QueueEntry::Marker(mask) => format!("M[{}]", mask.to_numbered_string()),
            })
            .collect()
    }

    #[test]
    fn enqueue_reports_tail_marker_last() {
        let mut store = UpdateStore::new();
        let mut queue = UpdateQueue::new();
        queue.join(0);

        let u1 = make_update(&mut store, &[0]);
        let u2 = make_update(&mut store, &[0]);
        assert!(queue.enqueue(u1, &mut store));
        assert!(!queue.enqueue(u2, &mut store));
        assert_eq!(layout(&queue), ["M[0]", "U", "U"]);

        queue.dequeue(u1, &mut store);
        assert_eq!(layout(&queue), ["M[0]", "U"]);
        queue.dequeue(u2, &mut store);
        assert!(queue.is_empty());
        assert!(store.get(u1).queue_slot().is_none());
    }

    #[test]
    fn traversal() {
        let mut store = UpdateStore::new();
        let mut queue = UpdateQueue::new();
        queue.join(3);

        let u1 = make_update(&mut store, &[3]);
        let u2 = make_update(&mut store, &[3]);
        queue.enqueue(u1, &mut store);
        queue.enqueue(u2, &mut store);

        let tail = queue.tail_marker();
        let first = queue.next(tail).unwrap();
        let second = queue.next(first).unwrap();
        assert!(queue.next(second).is_none());
        assert_eq!(queue.previous(first), Some(tail));
        assert!(queue.previous(tail).is_none());
        assert_eq!(queue.last(), second);
        assert!(matches!(queue.entry(first), QueueEntry::Update(id) if id == u1));
    }

    #[test]
    fn marker_split_and_merge() {
        let mut store = UpdateStore::new();
        let mut queue = UpdateQueue::new();
        for bit in 0..3 {
            queue.join(bit);
        }
        let u1 = make_update(&mut store, &[0, 1, 2]);
        queue.enqueue(u1, &mut store);

        // A finished sweep leaves the tail marker past the update; then
        // clients 0 and 2 are parked back before it.
        let slot = store.get(u1).queue_slot().unwrap();
        queue.move_marker_after(queue.tail_marker(), slot);
        let mut split = BitSet::new();
        split.set(0);
        split.set(2);
        let parked = queue.marker_split_before(queue.tail_marker(), slot, &split);
        assert_eq!(layout(&queue), ["M[0,2]", "U", "M[1]"]);
        assert_eq!(queue.get_marker(0), Some(parked));
        assert_eq!(queue.get_marker(2), Some(parked));
        assert_eq!(queue.get_marker(1), Some(queue.tail_marker()));

        // Client 0 catches up into the tail marker.
        let catch_up = BitSet::single(0);
        queue.marker_merge(queue.tail_marker(), parked, &catch_up);
        assert_eq!(layout(&queue), ["M[2]", "U", "M[0,1]"]);

        // Client 2 catches up too; the parked marker disappears.
        let catch_up = BitSet::single(2);
        queue.marker_merge(queue.tail_marker(), parked, &catch_up);
        assert_eq!(layout(&queue), ["U", "M[0,1,2]"]);
        assert_eq!(queue.get_marker(2), Some(queue.tail_marker()));
    }

    #[test]
    fn marker_moves() {
        let mut store = UpdateStore::new();
        let mut queue = UpdateQueue::new();
        queue.join(0);
        queue.join(1);

        let u1 = make_update(&mut store, &[0, 1]);
        let u2 = make_update(&mut store, &[0, 1]);
        queue.enqueue(u1, &mut store);
        queue.enqueue(u2, &mut store);

        let parked = queue.marker_split_after(
            queue.tail_marker(),
            store.get(u1).queue_slot().unwrap(),
            &BitSet::single(1),
        );
        assert_eq!(layout(&queue), ["M[0]", "U", "M[1]", "U"]);

        queue.move_marker_after(parked, queue.last());
        assert_eq!(layout(&queue), ["M[0]", "U", "U", "M[1]"]);

        queue.move_marker_before(parked, store.get(u2).queue_slot().unwrap());
        assert_eq!(layout(&queue), ["M[0]", "U", "M[1]", "U"]);

        // Moving relative to itself is a no-op.
        queue.move_marker_after(parked, parked);
        assert_eq!(layout(&queue), ["M[0]", "U", "M[1]", "U"]);
    }

    #[test]
    #[should_panic(expected = "advertise at least one client")]
    fn enqueue_rejects_empty_advertise() {
        let mut store = UpdateStore::new();
        let mut queue = UpdateQueue::new();
        let id = store.alloc(Update::new(
            StateRef::Node(NodeId::new(0)),
            UpdateKind::Update,
        ));
        queue.enqueue(id, &mut store);
    }
}
