use crate::*;

use hns_switch::{DeliveryMode, DeliveryPath, RelayState};

/// Relay at R, alice at A, bob at B, both registered with the relay.
fn two_peers() -> (
    Network,
    RelayEndpoint,
    (Arc<SwitchCore>, mpsc::UnboundedReceiver<SwitchEvent>),
    (Arc<SwitchCore>, mpsc::UnboundedReceiver<SwitchEvent>),
) {
    let mut net = Network::new();
    let relay = net.add_relay("r1", addr("198.51.100.1:7723"));
    let alice = net.add_switch("alice", addr("203.0.113.10:40000"), &[relay.clone()]);
    let bob = net.add_switch("bob", addr("203.0.113.20:50000"), &[relay.clone()]);
    net.pump();
    (net, relay, alice, bob)
}

#[test]
fn both_switches_register_with_the_relay() {
    let (net, relay, (alice, mut alice_events), (bob, _)) = two_peers();

    for core in [&alice, &bob] {
        let status = core.relay_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, RelayState::Connected);
        assert_eq!(status[0].observed, Some(core.local_addr()));
    }

    // The client's session id is the one the relay registered.
    let directory = net.relay(relay.address).directory();
    let registered = directory.find_by_client("alice").unwrap();
    assert_eq!(alice.relay_status()[0].session_id, Some(registered.session_id));
    assert_eq!(registered.address, alice.local_addr());

    assert_eq!(
        alice_events.try_recv().unwrap(),
        SwitchEvent::RelayConnected {
            relay_id: "r1".into(),
            observed: Some(alice.local_addr()),
        }
    );
}

#[test]
fn relayed_path_comes_up_before_direct() {
    let (net, _, (alice, _), (bob, mut bob_events)) = two_peers();
    net.block_direct(true);

    assert!(alice.add_host("bob"));
    alice.tick();
    net.pump();

    // QueryHost answered through the relay; pings to bob were dropped.
    let flags = alice.get_host("bob").unwrap();
    assert!(flags.connected && flags.connected_turn);
    assert!(!flags.connected_direct);

    let status = alice.host_status("bob").unwrap();
    assert_eq!(status.observed, vec![bob.local_addr()]);
    assert_eq!(status.turning_relays, vec!["r1".to_string()]);
    assert_eq!(status.usable_direct_sessions, 0);
    // The address exchange reply carries bob's bound address.
    assert_eq!(status.predicted, vec![bob.local_addr()]);

    // Bob learned of alice from the relayed address offer.
    let bob_view = bob.host_status("alice").unwrap();
    assert!(bob_view.flags.connected_turn);
    assert_eq!(bob_view.predicted, vec![alice.local_addr()]);

    // Relayed delivery works while direct is blocked.
    alice
        .send_message("bob", 7, b"via relay", DeliveryMode::TurnOnly)
        .unwrap();
    net.pump();
    assert_eq!(
        drain_messages(&mut bob_events),
        vec![SwitchEvent::Message {
            host_id: "alice".into(),
            message_id: 7,
            data: b"via relay".to_vec(),
            path: DeliveryPath::Relay {
                relay_id: "r1".into()
            },
        }]
    );
    assert!(matches!(
        alice.send_message("bob", 7, b"x", DeliveryMode::DirectOnly),
        Err(hns_switch::SendError::NotConnected)
    ));

    // Open the path; the next keep-alive ping completes the handshake.
    net.block_direct(false);
    next_round();
    alice.tick();
    net.pump();

    let flags = alice.get_host("bob").unwrap();
    assert!(flags.connected_direct && flags.connected_turn);
    assert!(bob.get_host("alice").unwrap().connected_direct);
    assert_eq!(
        alice.host_status("bob").unwrap().confirmed,
        vec![bob.local_addr()]
    );
}

#[test]
fn direct_sessions_are_never_duplicated() {
    let (net, _, (alice, _), (bob, _)) = two_peers();
    alice.add_host("bob");
    bob.add_host("alice");

    for _ in 0..5 {
        alice.tick();
        bob.tick();
        net.pump();
        next_round();
    }

    let a = alice.host_status("bob").unwrap();
    let b = bob.host_status("alice").unwrap();
    assert!(a.flags.connected_direct && b.flags.connected_direct);
    assert_eq!(a.direct_sessions, 1);
    assert_eq!(a.usable_direct_sessions, 1);
    assert_eq!(b.direct_sessions, 1);
    assert_eq!(b.usable_direct_sessions, 1);
    assert!(a.best_rtt.is_some());
    assert_eq!(a.sweep_window, 0);
}

#[test]
fn direct_messages_flow_both_ways() {
    let (net, _, (alice, mut alice_events), (bob, mut bob_events)) = two_peers();
    alice.add_host("bob");
    alice.tick();
    net.pump();
    assert!(alice.get_host("bob").unwrap().connected_direct);

    let report = alice
        .send_message("bob", 1, b"hello bob", DeliveryMode::DirectOnly)
        .unwrap();
    assert_eq!(report.direct, 1);
    assert_eq!(report.relayed, 0);
    net.pump();
    assert_eq!(
        drain_messages(&mut bob_events),
        vec![SwitchEvent::Message {
            host_id: "alice".into(),
            message_id: 1,
            data: b"hello bob".to_vec(),
            path: DeliveryPath::Direct,
        }]
    );

    // Bob's session was created by alice's ping and is already usable.
    bob.send_message("alice", 2, b"hello alice", DeliveryMode::DirectOnly)
        .unwrap();
    net.pump();
    assert_eq!(
        drain_messages(&mut alice_events),
        vec![SwitchEvent::Message {
            host_id: "bob".into(),
            message_id: 2,
            data: b"hello alice".to_vec(),
            path: DeliveryPath::Direct,
        }]
    );
}

#[test]
fn relay_restart_resets_and_reconnects() {
    let mut net = Network::new();
    let relay = net.add_relay("r1", addr("198.51.100.1:7723"));
    let (alice, mut events) = net.add_switch("alice", addr("203.0.113.10:40000"), &[relay.clone()]);
    net.pump();
    assert!(alice.relays()[0].is_connected());
    let first = alice.relay_status()[0].session_id;

    // A fresh relay at the same address knows nothing of alice.
    net.add_relay("r1", relay.address);
    alice.relays()[0].query_host("bob");
    net.pump();

    let mut saw_lost = false;
    while let Ok(event) = events.try_recv() {
        if event == (SwitchEvent::RelayLost { relay_id: "r1".into() }) {
            saw_lost = true;
        }
    }
    assert!(saw_lost);
    // The reconnect completed against the new relay in the same pump.
    assert!(alice.relays()[0].is_connected());
    assert_ne!(alice.relay_status()[0].session_id, first);
}
