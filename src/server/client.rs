//! Subscribed agents and their registry.

use fnv::{FnvHashMap, FnvHashSet};
use log::debug;
use serde::Serialize;

use super::message::UpdateMessage;
use crate::bitset::IndexAllocator;

/// A subscribed agent, as seen from the server core.
///
/// Implementations wrap the session that carries updates to the agent. The
/// core never retries a failed send on its own; it waits for the session to
/// signal writability through
/// [`SenderHandle::send_active`](super::update_sender::SenderHandle::send_active).
pub trait Client {
    /// Stable identifier, also the name of the client's anchor node.
    fn identifier(&self) -> &str;

    /// Hands one closed message to the client's session.
    ///
    /// Returns `false` when the session cannot take more data; the client is
    /// then considered blocked and keeps its position in the queue.
    fn send_update(&mut self, message: &UpdateMessage) -> bool;
}

/// Delivery counters kept per client.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ClientStats {
    pub msgs_sent: u64,
    pub msgs_blocked: u64,
    pub update_nodes_sent: u64,
    pub delete_nodes_sent: u64,
    pub update_links_sent: u64,
    pub delete_links_sent: u64,
}

/// Registry-side record of one client.
pub(crate) struct ClientInfo {
    pub(crate) client: Box<dyn Client>,
    pub(crate) stats: ClientStats,
    /// UUIDs of the VMs the client has subscribed to.
    pub(crate) vms: FnvHashSet<String>,
}

/// Registered clients, addressable by identifier and by index.
///
/// The index is the client's bit inside every interest and advertised
/// bitset; the smallest free index is reused so the bitsets stay short.
pub(crate) struct ClientRegistry {
    infos: FnvHashMap<usize, ClientInfo>,
    by_name: FnvHashMap<String, usize>,
    indexes: IndexAllocator,
}

impl ClientRegistry {
    pub(crate) fn new() -> Self {
        Self {
            infos: FnvHashMap::default(),
            by_name: FnvHashMap::default(),
            indexes: IndexAllocator::new(usize::MAX),
        }
    }

    /// Registers a client, returning its assigned index.
    pub(crate) fn register(&mut self, client: Box<dyn Client>) -> usize {
        let identifier = client.identifier().to_owned();
        assert!(
            !self.by_name.contains_key(&identifier),
            "client identifier already registered"
        );
        let index = self
            .indexes
            .alloc_index()
            .expect("client index space exhausted");
        debug!("register client {identifier} with index {index}");
        self.by_name.insert(identifier, index);
        self.infos.insert(
            index,
            ClientInfo {
                client,
                stats: ClientStats::default(),
                vms: FnvHashSet::default(),
            },
        );
        index
    }

    /// Removes a client, releasing its index for reuse.
    pub(crate) fn unregister(&mut self, index: usize) -> ClientInfo {
        let info = self
            .infos
            .remove(&index)
            .expect("unregistered client must exist");
        let identifier = info.client.identifier();
        debug!("unregister client {identifier} with index {index}");
        self.by_name.remove(identifier);
        self.indexes.free_index(index);
        info
    }

    pub(crate) fn find_index(&self, identifier: &str) -> Option<usize> {
        self.by_name.get(identifier).copied()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ClientInfo> {
        self.infos.get(&index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut ClientInfo> {
        self.infos.get_mut(&index)
    }

    pub(crate) fn identifier(&self, index: usize) -> Option<&str> {
        self.infos.get(&index).map(|info| info.client.identifier())
    }

    pub(crate) fn len(&self) -> usize {
        self.infos.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &ClientInfo)> {
        self.infos.iter().map(|(&index, info)| (index, info))
    }
}
