//! Maps VM UUIDs to graph nodes and parks subscriptions that arrive before
//! their VM exists.
//!
//! Agents subscribe to VMs by UUID, but the configuration pipeline may not
//! have added the VM node yet (or may have deleted it, pending a revival).
//! Such subscriptions wait in a pending list keyed by UUID and are replayed
//! as soon as a usable node shows up.

use fnv::FnvHashMap;
use log::debug;

use crate::graph::{Graph, NodeId};

/// A subscription waiting for its VM node.
#[derive(Debug, Clone)]
pub(crate) struct PendingVmReg {
    pub(crate) vr_name: String,
}

#[derive(Debug, Default)]
pub(crate) struct VmRegistry {
    by_uuid: FnvHashMap<String, NodeId>,
    by_node: FnvHashMap<NodeId, String>,
    pending: FnvHashMap<String, PendingVmReg>,
}

impl VmRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tracks a VM node notification.
    ///
    /// Returns the node's UUID when a pending subscription can now be
    /// replayed against it.
    pub(crate) fn observe_node(
        &mut self,
        graph: &Graph,
        id: NodeId,
        vm_node_type: &str,
    ) -> Option<String> {
        if !graph.contains_node(id) {
            return None;
        }
        let node = graph.node(id);
        if node.node_type() != vm_node_type {
            return None;
        }
        if node.is_deleted() {
            if let Some(uuid) = self.by_node.remove(&id) {
                self.by_uuid.remove(&uuid);
            }
            return None;
        }
        let uuid = node.uuid()?;
        self.by_uuid.insert(uuid.to_owned(), id);
        self.by_node.insert(id, uuid.to_owned());
        self.pending.contains_key(uuid).then(|| uuid.to_owned())
    }

    pub(crate) fn node_by_uuid(&self, uuid: &str) -> Option<NodeId> {
        self.by_uuid.get(uuid).copied()
    }

    /// Parks a subscription until the VM node appears.
    pub(crate) fn set_pending(&mut self, vm_uuid: &str, vr_name: &str) {
        debug!("pending vm registration {vm_uuid} for {vr_name}");
        self.pending.insert(
            vm_uuid.to_owned(),
            PendingVmReg {
                vr_name: vr_name.to_owned(),
            },
        );
    }

    pub(crate) fn take_pending(&mut self, vm_uuid: &str) -> Option<PendingVmReg> {
        self.pending.remove(vm_uuid)
    }

    /// Drops a pending entry when its client unsubscribes or unregisters.
    pub(crate) fn cancel_pending(&mut self, vm_uuid: &str, vr_name: &str) {
        if self
            .pending
            .get(vm_uuid)
            .is_some_and(|reg| reg.vr_name == vr_name)
        {
            self.pending.remove(vm_uuid);
        }
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = (&str, &PendingVmReg)> {
        self.pending.iter().map(|(uuid, reg)| (uuid.as_str(), reg))
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn uuid_map(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.by_uuid.iter().map(|(uuid, &id)| (uuid.as_str(), id))
    }

    pub(crate) fn uuid_map_size(&self) -> usize {
        self.by_uuid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_waits_for_node() {
        let mut graph = Graph::new();
        let mut registry = VmRegistry::new();
        registry.set_pending("uuid-1", "vr1");

        let vm = graph.insert_node("virtual-machine", "vm1");
        // No UUID yet: nothing to replay.
        assert_eq!(registry.observe_node(&graph, vm, "virtual-machine"), None);

        graph.set_uuid(vm, "uuid-1");
        assert_eq!(
            registry.observe_node(&graph, vm, "virtual-machine"),
            Some("uuid-1".to_owned())
        );
        assert_eq!(registry.node_by_uuid("uuid-1"), Some(vm));

        let reg = registry.take_pending("uuid-1").unwrap();
        assert_eq!(reg.vr_name, "vr1");
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn deleted_node_unmaps() {
        let mut graph = Graph::new();
        let mut registry = VmRegistry::new();
        let vm = graph.insert_node("virtual-machine", "vm1");
        graph.set_uuid(vm, "uuid-1");
        registry.observe_node(&graph, vm, "virtual-machine");
        assert_eq!(registry.uuid_map_size(), 1);

        graph.delete_node(vm);
        registry.observe_node(&graph, vm, "virtual-machine");
        assert_eq!(registry.node_by_uuid("uuid-1"), None);
        assert_eq!(registry.uuid_map_size(), 0);
    }

    #[test]
    fn cancel_requires_matching_client() {
        let mut registry = VmRegistry::new();
        registry.set_pending("uuid-1", "vr1");
        registry.cancel_pending("uuid-1", "vr2");
        assert_eq!(registry.pending_len(), 1);
        registry.cancel_pending("uuid-1", "vr1");
        assert_eq!(registry.pending_len(), 0);
    }
}
