use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ifmap_server::prelude::*;

/// White-list mirroring the slice of the schema the tests use:
/// vr → vm → vmi → vn.
pub fn white_list() -> TraversalWhiteList {
    let mut list = TraversalWhiteList::new();
    list.allow_metadata("virtual-router-virtual-machine");
    list.allow_metadata("virtual-machine-virtual-machine-interface");
    list.allow_metadata("virtual-machine-interface-virtual-network");
    list.allow_neighbor("virtual-router", "virtual-machine");
    list.allow_neighbor("virtual-machine", "virtual-machine-interface");
    list.allow_neighbor("virtual-machine-interface", "virtual-network");
    list
}

pub fn test_server() -> Server {
    Server::new(ServerConfig::default(), white_list())
}

#[derive(Default)]
struct MockState {
    /// Messages in arrival order, already decoded.
    messages: Vec<Vec<ObjectDiff>>,
    /// `None` accepts everything. `Some(n)` answers `true` for the next `n`
    /// messages and `false` afterwards; a refused message is still accepted
    /// by the session, `false` only means "stop sending".
    accept_budget: Option<u64>,
}

/// Test double for a subscribed agent, recording everything it receives.
pub struct MockClient {
    identifier: String,
    state: Arc<Mutex<MockState>>,
}

/// Shared view onto a [`MockClient`]'s received data and blocking knob.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    pub fn new(identifier: &str) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                identifier: identifier.to_owned(),
                state: state.clone(),
            },
            MockHandle { state },
        )
    }
}

impl Client for MockClient {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn send_update(&mut self, message: &UpdateMessage) -> bool {
        assert_eq!(message.receiver, self.identifier);
        let mut state = self.state.lock().unwrap();
        let objects = decode_objects(&message.payload).expect("payload must decode");
        assert_eq!(objects.len(), message.object_count);
        state.messages.push(objects);
        match &mut state.accept_budget {
            None => true,
            Some(0) => false,
            Some(budget) => {
                *budget -= 1;
                true
            }
        }
    }
}

#[allow(dead_code)]
impl MockHandle {
    pub fn set_accept_budget(&self, budget: Option<u64>) {
        self.state.lock().unwrap().accept_budget = budget;
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// All received entries, flattened in arrival order.
    pub fn objects(&self) -> Vec<ObjectDiff> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().messages.clear();
    }

    pub fn node_update_count(&self, name: &str) -> usize {
        self.objects()
            .iter()
            .filter(|diff| {
                matches!(diff, ObjectDiff::NodeUpdate { name: n, .. } if n == name)
            })
            .count()
    }

    pub fn node_delete_count(&self, name: &str) -> usize {
        self.objects()
            .iter()
            .filter(|diff| {
                matches!(diff, ObjectDiff::NodeDelete { name: n, .. } if n == name)
            })
            .count()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_update_count(name) > 0
    }
}

/// Standard fixture: two virtual networks and per-client vm/vmi/vr chains.
///
/// Wiring: `vm:<name>` — `vmi:<name>` — `vn:<color>`; the vr→vm link is
/// added per test through subscription or directly.
pub struct Fixture {
    pub server: Server,
    pub blue: NodeId,
    pub red: NodeId,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        let mut server = test_server();
        let graph = server.graph_mut();
        let blue = graph.insert_node("virtual-network", "blue");
        let red = graph.insert_node("virtual-network", "red");
        graph.set_config(blue, Bytes::from_static(b"vn blue"));
        graph.set_config(red, Bytes::from_static(b"vn red"));
        Self { server, blue, red }
    }

    /// Adds a vm chained to the given network through a vmi.
    pub fn add_vm(&mut self, name: &str, uuid: &str, network: NodeId) -> NodeId {
        let graph = self.server.graph_mut();
        let vm = graph.insert_node("virtual-machine", name);
        graph.set_uuid(vm, uuid);
        graph.set_config(vm, Bytes::from(format!("vm {name}")));
        let vmi = graph.insert_node("virtual-machine-interface", &format!("vmi-{name}"));
        graph.set_config(vmi, Bytes::from(format!("vmi {name}")));
        graph.insert_link(vm, vmi, "virtual-machine-virtual-machine-interface");
        graph.insert_link(vmi, network, "virtual-machine-interface-virtual-network");
        vm
    }

    pub fn add_vr(&mut self, name: &str) -> NodeId {
        let graph = self.server.graph_mut();
        let vr = graph.insert_node("virtual-router", name);
        graph.set_config(vr, Bytes::from(format!("vr {name}")));
        vr
    }

    pub fn register(&mut self, name: &str) -> (usize, MockHandle) {
        let (client, handle) = MockClient::new(name);
        let index = self.server.client_register(Box::new(client));
        (index, handle)
    }

    pub fn link_vr_vm(&mut self, vr: NodeId, vm: NodeId) -> LinkId {
        self.server
            .graph_mut()
            .insert_link(vr, vm, "virtual-router-virtual-machine")
    }

    pub fn run(&mut self) {
        self.server.run().expect("pump must not fail");
    }
}

/// Checks the queue-level invariants that must hold at any quiescent point:
/// every update entry still advertises someone, every registered client sits
/// in exactly one marker, and no marker except the tail is empty.
#[allow(dead_code)]
pub fn assert_queue_invariants(server: &Server, client_indexes: &[usize]) {
    let entries = server.show_queue();
    let mut seen = BitSet::new();
    let mut tail_markers = 0;
    for entry in &entries {
        match entry.entry_type.as_str() {
            "Update" | "Delete" => {
                let advertise = BitSet::from_str(&entry.bits).unwrap();
                assert!(
                    !advertise.is_empty(),
                    "queued entry {} advertises nobody",
                    entry.name
                );
            }
            "Marker" | "Tail-Marker" => {
                let mask = BitSet::from_str(&entry.bits).unwrap();
                assert!(
                    !seen.intersects(&mask),
                    "client appears in two markers: {entries:?}"
                );
                seen |= &mask;
                if entry.entry_type == "Tail-Marker" {
                    tail_markers += 1;
                } else {
                    assert!(!mask.is_empty(), "non-tail marker with empty mask");
                }
            }
            other => panic!("unexpected queue entry type {other}"),
        }
    }
    assert_eq!(tail_markers, 1, "exactly one tail marker");
    let mut registered = BitSet::new();
    for &index in client_indexes {
        registered.set(index);
    }
    assert_eq!(
        seen, registered,
        "marker masks must cover exactly the registered clients"
    );
}
