//! Reachability scenarios: VM subscriptions pull in exactly the white-listed
//! closure, and subscriptions for not-yet-known VMs wait their turn.

mod common;

use common::*;

#[test_log::test]
fn vn_propagation_single_network() {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    let red = fixture.red;
    fixture.add_vm("vm-1", "uuid-1", blue);
    fixture.add_vm("vm-2", "uuid-2", red);
    let (_, handle) = fixture.register("vr-x");
    fixture.run();

    fixture.server.vm_subscribe("vr-x", "uuid-1", true);
    fixture.run();

    // Only the subscribed chain arrives: the anchor, the vm, its interface
    // and its network. The other network stays invisible.
    assert!(handle.has_node("vr-x"));
    assert!(handle.has_node("vm-1"));
    assert!(handle.has_node("vmi-vm-1"));
    assert!(handle.has_node("blue"));
    assert!(!handle.has_node("vm-2"));
    assert!(!handle.has_node("red"));

    let vm2 = fixture.server.graph().find_node("virtual-machine", "vm-2");
    let (interest, _) = fixture.server.node_state_sets(vm2.unwrap()).unwrap();
    assert!(interest.is_empty());

    assert_eq!(fixture.server.uuid_map_size(), 2);
    let uuid_map = fixture.server.show_uuid_map();
    assert!(
        uuid_map
            .iter()
            .any(|entry| entry.vm_uuid == "uuid-1" && entry.node_name == "vm-1")
    );
}

#[test_log::test]
fn subscribe_second_vm_extends_interest() {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    let red = fixture.red;
    fixture.add_vm("vm-1", "uuid-1", blue);
    fixture.add_vm("vm-2", "uuid-2", red);
    let (_, handle) = fixture.register("vr-x");
    fixture.run();

    fixture.server.vm_subscribe("vr-x", "uuid-1", true);
    fixture.run();
    fixture.server.vm_subscribe("vr-x", "uuid-2", true);
    fixture.run();

    assert!(handle.has_node("blue"));
    assert!(handle.has_node("red"));
    assert_eq!(handle.node_update_count("blue"), 1, "no re-send on growth");
}

#[test_log::test]
fn unsubscribe_withdraws_closure() {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    fixture.add_vm("vm-1", "uuid-1", blue);
    let (index, handle) = fixture.register("vr-x");
    fixture.run();
    fixture.server.vm_subscribe("vr-x", "uuid-1", true);
    fixture.run();
    handle.clear();

    fixture.server.vm_subscribe("vr-x", "uuid-1", false);
    fixture.run();

    assert_eq!(handle.node_delete_count("blue"), 1);
    assert_eq!(handle.node_delete_count("vm-1"), 1);
    assert_eq!(handle.node_delete_count("vr-x"), 0, "anchor stays");

    let (interest, advertised) = fixture.server.node_state_sets(blue).unwrap();
    assert!(!interest.test(index));
    assert!(!advertised.test(index));
    assert!(fixture.server.queue_is_empty());
}

#[test_log::test]
fn pending_subscription_waits_for_the_vm() {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    let (_, handle) = fixture.register("vr-x");
    fixture.run();

    // The VM is not in the graph yet: the request parks.
    fixture.server.vm_subscribe("vr-x", "uuid-later", true);
    fixture.run();
    assert_eq!(fixture.server.pending_vm_reg_count(), 1);
    assert_eq!(fixture.server.stats().vm_subscribe_pending, 1);
    assert!(!handle.has_node("blue"));

    // The configuration catches up; the parked request replays.
    fixture.add_vm("vm-late", "uuid-later", blue);
    fixture.run();

    assert_eq!(fixture.server.pending_vm_reg_count(), 0);
    assert_eq!(fixture.server.stats().vm_pending_drained, 1);
    assert!(handle.has_node("vm-late"));
    assert!(handle.has_node("blue"));
}

#[test_log::test]
fn pending_subscription_can_be_cancelled() {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    let (_, handle) = fixture.register("vr-x");
    fixture.run();

    fixture.server.vm_subscribe("vr-x", "uuid-later", true);
    fixture.server.vm_subscribe("vr-x", "uuid-later", false);
    fixture.run();
    assert_eq!(fixture.server.pending_vm_reg_count(), 0);

    fixture.add_vm("vm-late", "uuid-later", blue);
    fixture.run();
    assert!(!handle.has_node("vm-late"), "cancelled request must not replay");
}

#[test_log::test]
fn subscribe_for_unknown_client_is_dropped() {
    let mut fixture = Fixture::new();
    fixture.server.vm_subscribe("vr-ghost", "uuid-1", true);
    fixture.run();
    assert_eq!(fixture.server.stats().vm_subscribe_no_client, 1);
    assert_eq!(fixture.server.pending_vm_reg_count(), 0);
}
