//! Sender scenarios: slow receivers split off and catch up without ever
//! stalling others or receiving duplicates.

mod common;

use bytes::Bytes;
use common::*;
use ifmap_server::prelude::*;

/// Builds two clients subscribed to the same four entities and returns
/// their indexes and handles. One config touch per entity gives four
/// coalesced updates addressed to both clients.
fn two_client_fixture() -> (Fixture, [(usize, MockHandle); 2], [NodeId; 4]) {
    let mut fixture = Fixture::new();
    let blue = fixture.blue;
    let red = fixture.red;
    let vm_x = fixture.add_vm("vm-x", "uuid-x", blue);
    let vm_y = fixture.add_vm("vm-y", "uuid-y", red);
    let vr1 = fixture.add_vr("vr-c1");
    let vr2 = fixture.add_vr("vr-c2");
    let c1 = fixture.register("vr-c1");
    let c2 = fixture.register("vr-c2");
    for vr in [vr1, vr2] {
        for vm in [vm_x, vm_y] {
            fixture.link_vr_vm(vr, vm);
        }
    }
    fixture.run();
    // One entry per message from here on, so messages are countable.
    fixture.server.set_objects_per_message(1);
    (fixture, [c1, c2], [vm_x, blue, vm_y, red])
}

fn touch_all(fixture: &mut Fixture, targets: &[NodeId], tag: &str) {
    for (position, &node) in targets.iter().enumerate() {
        let config = Bytes::from(format!("rev {tag} {position}"));
        fixture.server.graph_mut().set_config(node, config);
    }
}

#[test_log::test]
fn blocked_client_does_not_stall_others() {
    let (mut fixture, [c1, c2], targets) = two_client_fixture();
    let indexes = [c1.0, c2.0];

    // Both clients accept one message, then block.
    c1.1.clear();
    c2.1.clear();
    c1.1.set_accept_budget(Some(0));
    c2.1.set_accept_budget(Some(0));

    touch_all(&mut fixture, &targets, "a");
    fixture.run();

    assert_eq!(c1.1.message_count(), 1);
    assert_eq!(c2.1.message_count(), 1);
    assert!(fixture.server.is_client_blocked(c1.0));
    assert!(fixture.server.is_client_blocked(c2.0));
    assert!(!fixture.server.queue_is_empty());
    assert_queue_invariants(&fixture.server, &indexes);

    // Unblock c1 three times: each wake-up delivers exactly one message
    // before the session blocks again. c2 stays parked the whole time.
    let handle = fixture.server.sender_handle();
    for round in 1..=3 {
        handle.send_active(c1.0);
        fixture.run();
        assert_eq!(c1.1.message_count(), 1 + round);
        assert_eq!(c2.1.message_count(), 1, "c2 must not be disturbed");
        assert_queue_invariants(&fixture.server, &indexes);
    }
    assert_eq!(c1.1.message_count(), 4, "c1 finished while c2 is blocked");

    for round in 1..=3 {
        handle.send_active(c2.0);
        fixture.run();
        assert_eq!(c2.1.message_count(), 1 + round);
    }

    // Both converged, nothing was delivered twice, only the tail marker is
    // left.
    for handle in [&c1.1, &c2.1] {
        assert_eq!(handle.message_count(), 4);
        for name in ["vm-x", "blue", "vm-y", "red"] {
            assert_eq!(handle.node_update_count(name), 1, "{name} sent once");
        }
    }
    assert!(fixture.server.queue_is_empty());
    assert_queue_invariants(&fixture.server, &indexes);
}

#[test_log::test]
fn leave_mid_flight() {
    let (mut fixture, [c0, c1], targets) = two_client_fixture();

    c0.1.clear();
    c1.1.clear();
    c0.1.set_accept_budget(Some(0));

    touch_all(&mut fixture, &targets, "b");
    fixture.run();

    // c0 blocked after the first message; c1 consumed the whole queue.
    assert_eq!(c0.1.message_count(), 1);
    assert_eq!(c1.1.message_count(), 4);
    assert!(!fixture.server.queue_is_empty());

    // Unregister the parked client mid-stream.
    assert!(fixture.server.client_unregister("vr-c1"));
    fixture.run();

    assert!(fixture.server.queue_is_empty());
    assert_queue_invariants(&fixture.server, &[c1.0]);
    assert_eq!(c1.1.message_count(), 4, "survivor unaffected");

    // The queue keeps flowing for the remaining client.
    touch_all(&mut fixture, &targets, "c");
    fixture.run();
    for name in ["vm-x", "blue", "vm-y", "red"] {
        assert_eq!(c1.1.node_update_count(name), 2);
    }
    assert!(fixture.server.queue_is_empty());
}

#[test_log::test]
fn spurious_triggers_are_harmless() {
    let (mut fixture, [c1, c2], _) = two_client_fixture();
    c1.1.clear();
    c2.1.clear();

    let handle = fixture.server.sender_handle();
    handle.send_active(c1.0);
    handle.send_active(c1.0);
    handle.queue_active();
    fixture.run();
    fixture.run();

    assert_eq!(c1.1.message_count(), 0);
    assert_eq!(c2.1.message_count(), 0);
    assert!(fixture.server.queue_is_empty());
}
