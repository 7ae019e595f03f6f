//! Drains the update queue cooperatively and batches messages per recipient
//! set.
//!
//! The sender sweeps forward from a marker, encoding entries whose advertise
//! set covers the marker's clients. Clients whose session refuses data are
//! split off into their own marker at their current position and left behind;
//! ready clients keep going. When a blocked client becomes writable again the
//! session signals [`SenderHandle::send_active`] and the next sweep resumes
//! from that client's own marker, eventually merging it back into the tail
//! marker. The advertise bitsets guarantee no client ever receives the same
//! update twice.

use std::mem;
use std::sync::{Arc, Mutex};

use log::trace;

use super::client::ClientRegistry;
use super::exporter::Exporter;
use super::message::{MessageBuilder, UpdateMessage};
use super::update::{StateRef, UpdateId, UpdateKind};
use super::update_queue::{EntryId, QueueEntry, UpdateQueue};
use crate::bitset::BitSet;
use crate::graph::Graph;

#[derive(Debug, Default)]
struct TriggerState {
    /// Coalesces wake-ups: set by both triggers, cleared when the sweep runs.
    task_scheduled: bool,
    queue_active: bool,
    send_scheduled: BitSet,
}

/// Thread-safe trigger side of the sender.
///
/// Cloneable and callable from any thread; both triggers are idempotent
/// under spurious invocations. The exporter raises `queue_active` when it
/// appends behind the tail marker, sessions raise `send_active` when a
/// previously blocked client drains its write buffer.
#[derive(Debug, Clone, Default)]
pub struct SenderHandle {
    state: Arc<Mutex<TriggerState>>,
}

impl SenderHandle {
    /// Signals that the queue has elements to transmit.
    pub fn queue_active(&self) {
        let mut state = self.state.lock().expect("sender trigger lock poisoned");
        state.queue_active = true;
        state.task_scheduled = true;
    }

    /// Signals that a previously blocked client is ready for more data.
    pub fn send_active(&self, index: usize) {
        let mut state = self.state.lock().expect("sender trigger lock poisoned");
        state.send_scheduled.set(index);
        state.task_scheduled = true;
    }

    fn take_scheduled(&self) -> Option<(bool, BitSet)> {
        let mut state = self.state.lock().expect("sender trigger lock poisoned");
        if !state.task_scheduled {
            return None;
        }
        state.task_scheduled = false;
        let queue_active = mem::take(&mut state.queue_active);
        let send_scheduled = mem::take(&mut state.send_scheduled);
        Some((queue_active, send_scheduled))
    }

    fn clear_client(&self, index: usize) {
        let mut state = self.state.lock().expect("sender trigger lock poisoned");
        state.send_scheduled.reset(index);
    }
}

pub struct UpdateSender {
    handle: SenderHandle,
    message: MessageBuilder,
    /// Clients whose session currently refuses data.
    send_blocked: BitSet,
}

impl UpdateSender {
    pub fn new(objects_per_message: usize) -> Self {
        Self {
            handle: SenderHandle::default(),
            message: MessageBuilder::new(objects_per_message),
            send_blocked: BitSet::new(),
        }
    }

    /// Returns the trigger side, for the exporter and the session layer.
    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    pub fn set_objects_per_message(&mut self, count: usize) {
        self.message.set_objects_per_message(count);
    }

    pub fn is_client_blocked(&self, index: usize) -> bool {
        self.send_blocked.test(index)
    }

    /// Drops a terminating client from the trigger and blocked sets.
    pub fn cleanup_client(&mut self, index: usize) {
        self.handle.clear_client(index);
        self.send_blocked.reset(index);
    }

    /// Runs one send task if one was scheduled. Returns whether it ran.
    pub(crate) fn run(
        &mut self,
        queue: &mut UpdateQueue,
        exporter: &mut Exporter,
        clients: &mut ClientRegistry,
        graph: &mut Graph,
    ) -> postcard::Result<bool> {
        let Some((queue_active, send_scheduled)) = self.handle.take_scheduled() else {
            return Ok(false);
        };
        self.send_blocked.subtract(&send_scheduled);
        for bit in send_scheduled.ones() {
            // Sweep from the client's own marker; the client may be gone by
            // the time the task runs.
            if let Some(marker) = queue.get_marker(bit) {
                trace!("send scheduled for client {bit}");
                self.send(marker, queue, exporter, clients, graph)?;
            }
        }
        if queue_active {
            trace!("queue active, sweeping from the tail marker");
            self.send(queue.tail_marker(), queue, exporter, clients, graph)?;
        }
        Ok(true)
    }

    /// One sweep from `start_marker` towards the tail.
    ///
    /// Returns under two conditions only: every client of the marker is
    /// blocked, or the end of the queue was reached. While sweeping, the
    /// working marker contains only ready clients; whoever blocks is split
    /// out at its current position immediately.
    fn send(
        &mut self,
        start_marker: EntryId,
        queue: &mut UpdateQueue,
        exporter: &mut Exporter,
        clients: &mut ClientRegistry,
        graph: &mut Graph,
    ) -> postcard::Result<()> {
        let mut marker = start_marker;

        let mask = queue.marker_mask(marker).clone();
        let blocked_clients = &mask & &self.send_blocked;
        if blocked_clients == mask {
            return Ok(());
        }
        if !blocked_clients.is_empty() {
            // Blocked clients keep their old position; continue with the
            // ready subset.
            queue.marker_split_before(marker, marker, &blocked_clients);
        }

        let mut base_send_set = BitSet::new();
        let mut next = queue.next(marker);
        while let Some(curr) = next {
            next = queue.next(curr);

            if queue.is_marker(curr) {
                // Clients in the next marker have already seen everything in
                // the buffer; flush to the current set first so merging the
                // markers cannot produce duplicates.
                if !self.message.is_empty() {
                    self.flush(&base_send_set, clients);
                }
                let (merged, done) = self.process_marker(marker, curr, queue);
                if done {
                    return Ok(());
                }
                marker = merged;
                base_send_set.clear();
                continue;
            }

            let QueueEntry::Update(update) = queue.entry(curr) else {
                unreachable!("queue entries are updates or markers");
            };
            let mut send_set = exporter.update(update).advertise() & queue.marker_mask(marker);
            if send_set.is_empty() {
                continue;
            }
            if base_send_set.is_empty() {
                base_send_set = send_set.clone();
            }

            // Flush when the buffer is full or the recipient set changes.
            if self.message.is_full() || (base_send_set != send_set && !self.message.is_empty()) {
                let blocked_set = self.flush(&base_send_set, clients);
                if !blocked_set.is_empty() {
                    if blocked_set == *queue.marker_mask(marker) {
                        queue.move_marker_before(marker, curr);
                        return Ok(());
                    }
                    // Only a subset blocked; they have seen everything before
                    // `curr`, so park them right here and continue with the
                    // ready remainder.
                    queue.marker_split_before(marker, curr, &blocked_set);
                    send_set.subtract(&blocked_set);
                }
                base_send_set = send_set;
            }

            self.process_update(update, &base_send_set, queue, exporter, clients, graph)?;
        }

        if !self.message.is_empty() {
            self.flush(&base_send_set, clients);
        }
        let last = queue.last();
        if marker != last {
            // Reaching the end means the sweep was running the tail marker.
            // Move it after the last element even if some clients blocked on
            // the final flush; splitting now would be wasted work if they
            // become ready before the next sweep.
            assert_eq!(
                marker,
                queue.tail_marker(),
                "sweep past the end must be the tail marker's"
            );
            queue.move_marker_after(marker, last);
        }
        Ok(())
    }

    /// Merges the working marker into the marker it ran into.
    ///
    /// The blocked subset of the union, if any, is split off immediately
    /// before the merged marker. Returns the marker holding the ready set
    /// and whether nobody is left ready.
    fn process_marker(
        &mut self,
        marker: EntryId,
        next_marker: EntryId,
        queue: &mut UpdateQueue,
    ) -> (EntryId, bool) {
        assert!(
            marker != queue.tail_marker(),
            "no marker exists beyond the tail marker"
        );
        let total = queue.marker_mask(marker) | queue.marker_mask(next_marker);
        let blocked = &total & &self.send_blocked;
        let ready = total.difference(&blocked);

        let mmove = queue.marker_mask(marker).clone();
        queue.marker_merge(next_marker, marker, &mmove);
        debug_assert_eq!(*queue.marker_mask(next_marker), total);
        if !blocked.is_empty() && !ready.is_empty() {
            queue.marker_split_before(next_marker, next_marker, &blocked);
        }
        (next_marker, ready.is_empty())
    }

    /// Encodes one update into the buffer and advances its bookkeeping.
    fn process_update(
        &mut self,
        update: UpdateId,
        base_send_set: &BitSet,
        queue: &mut UpdateQueue,
        exporter: &mut Exporter,
        clients: &mut ClientRegistry,
        graph: &mut Graph,
    ) -> postcard::Result<()> {
        self.count_sent(update, base_send_set, exporter, clients);
        self.message.encode_update(exporter.update(update), graph)?;

        let entry = exporter.update_mut(update);
        entry.advertise_subtract(base_send_set);
        let is_delete = entry.is_delete();
        if entry.advertise().is_empty() {
            queue.dequeue(update, exporter.updates_mut());
        }
        // The update may be released here.
        exporter.state_update_on_dequeue(update, base_send_set, is_delete, graph);
        Ok(())
    }

    /// Closes the buffered message and hands a copy to every recipient.
    ///
    /// Returns the subset of `send_set` whose session refused the message;
    /// those clients are recorded as blocked.
    fn flush(&mut self, send_set: &BitSet, clients: &mut ClientRegistry) -> BitSet {
        assert!(!self.message.is_empty(), "flushing an empty message");
        let (payload, object_count) = self.message.finish();

        let mut blocked = BitSet::new();
        for bit in send_set.ones() {
            assert!(!self.send_blocked.test(bit));
            let info = clients
                .get_mut(bit)
                .expect("send set holds only registered clients");
            let message = UpdateMessage {
                receiver: info.client.identifier().to_owned(),
                object_count,
                payload: payload.clone(),
            };
            if info.client.send_update(&message) {
                info.stats.msgs_sent += 1;
            } else {
                trace!("client {bit} blocked");
                info.stats.msgs_blocked += 1;
                blocked.set(bit);
                self.send_blocked.set(bit);
            }
        }
        blocked
    }

    fn count_sent(
        &self,
        update: UpdateId,
        base_send_set: &BitSet,
        exporter: &Exporter,
        clients: &mut ClientRegistry,
    ) {
        let entry = exporter.update(update);
        for bit in base_send_set.ones() {
            let Some(info) = clients.get_mut(bit) else {
                continue;
            };
            match (entry.target(), entry.kind()) {
                (StateRef::Node(_), UpdateKind::Update) => info.stats.update_nodes_sent += 1,
                (StateRef::Node(_), UpdateKind::Delete) => info.stats.delete_nodes_sent += 1,
                (StateRef::Link(_), UpdateKind::Update) => info.stats.update_links_sent += 1,
                (StateRef::Link(_), UpdateKind::Delete) => info.stats.delete_links_sent += 1,
            }
        }
    }
}
