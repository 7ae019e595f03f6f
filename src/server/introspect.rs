//! Read-only views of server internals for operational debugging.
//!
//! Produced by the `show_*` methods on [`Server`](super::Server); all types
//! serialize so an introspection endpoint can dump them as-is.

use serde::Serialize;

use super::client::ClientStats;

/// One element of the update queue, in queue order.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryInfo {
    /// `Update`, `Delete`, `Marker` or `Tail-Marker`.
    pub entry_type: String,
    /// Entity identity, or `Marker` for markers.
    pub name: String,
    /// Advertise set for updates, client mask for markers, in the high-bit
    /// first textual form.
    pub bits: String,
}

/// One registered client with its tracker sizes and delivery counters.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMapEntry {
    pub identifier: String,
    pub index: usize,
    pub interest_states: usize,
    pub advertised_states: usize,
    pub is_blocked: bool,
    pub stats: ClientStats,
}

/// One entry of the VM UUID to node mapping.
#[derive(Debug, Clone, Serialize)]
pub struct UuidMapEntry {
    pub vm_uuid: String,
    pub node_name: String,
}

/// A VM subscription waiting for its node to appear.
#[derive(Debug, Clone, Serialize)]
pub struct PendingVmRegEntry {
    pub vm_uuid: String,
    pub vr_name: String,
}

/// A recently unregistered client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientHistoryEntry {
    pub identifier: String,
    pub index: usize,
}

/// Server-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub clients_registered: u64,
    pub clients_unregistered: u64,
    /// VM subscribe/unsubscribe requests dropped for unknown clients.
    pub vm_subscribe_no_client: u64,
    /// Subscriptions parked because the VM node did not exist yet.
    pub vm_subscribe_pending: u64,
    /// Parked subscriptions replayed after their VM node appeared.
    pub vm_pending_drained: u64,
}
