use crate::*;

use hns_switch::{DeliveryMode, DeliveryPath, DeliveryReport, SendError};

const R1: &str = "198.51.100.1:7723";
const R2: &str = "198.51.100.2:7723";
const A: &str = "203.0.113.10:40000";
const B: &str = "203.0.113.20:50000";

/// Alice and bob on two relays with a working direct path.
fn connected_pair() -> (
    Network,
    Arc<SwitchCore>,
    (Arc<SwitchCore>, mpsc::UnboundedReceiver<SwitchEvent>),
) {
    let mut net = Network::new();
    let r1 = net.add_relay("r1", addr(R1));
    let r2 = net.add_relay("r2", addr(R2));
    let (alice, _) = net.add_switch("alice", addr(A), &[r1.clone(), r2.clone()]);
    let (bob, mut bob_events) = net.add_switch("bob", addr(B), &[r1, r2]);
    net.pump();

    alice.add_host("bob");
    alice.tick();
    net.pump();

    let status = alice.host_status("bob").unwrap();
    assert!(status.flags.connected_direct);
    assert_eq!(status.turning_relays.len(), 2);

    drain_messages(&mut bob_events);
    net.clear_log();
    (net, alice, (bob, bob_events))
}

fn paths(events: Vec<SwitchEvent>) -> Vec<DeliveryPath> {
    let mut out: Vec<DeliveryPath> = events
        .into_iter()
        .filter_map(|e| match e {
            SwitchEvent::Message { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    out.sort_by_key(|p| format!("{p:?}"));
    out
}

fn relay(id: &str) -> DeliveryPath {
    DeliveryPath::Relay {
        relay_id: id.into(),
    }
}

#[test]
fn direct_only_sends_nothing_to_relays() {
    let (net, alice, (_, mut bob_events)) = connected_pair();

    let report = alice
        .send_message("bob", 3, b"payload", DeliveryMode::DirectOnly)
        .unwrap();
    assert_eq!(report, DeliveryReport { direct: 1, relayed: 0 });
    assert_eq!(net.count(addr(A), addr(R1)), 0);
    assert_eq!(net.count(addr(A), addr(R2)), 0);
    assert_eq!(net.count(addr(A), addr(B)), 1);

    net.pump();
    assert_eq!(paths(drain_messages(&mut bob_events)), vec![DeliveryPath::Direct]);
}

#[test]
fn turn_only_skips_the_direct_path() {
    let (net, alice, (_, mut bob_events)) = connected_pair();

    let report = alice
        .send_message("bob", 3, b"payload", DeliveryMode::TurnOnly)
        .unwrap();
    assert_eq!(report, DeliveryReport { direct: 0, relayed: 2 });
    assert_eq!(net.count(addr(A), addr(B)), 0);
    assert_eq!(net.count(addr(A), addr(R1)), 1);
    assert_eq!(net.count(addr(A), addr(R2)), 1);

    net.pump();
    assert_eq!(
        paths(drain_messages(&mut bob_events)),
        vec![relay("r1"), relay("r2")]
    );
}

#[test]
fn always_send_uses_every_relay_once() {
    let (net, alice, (_, mut bob_events)) = connected_pair();

    let report = alice
        .send_message("bob", 3, b"payload", DeliveryMode::AlwaysSend)
        .unwrap();
    assert_eq!(report, DeliveryReport { direct: 1, relayed: 2 });
    assert_eq!(net.count(addr(A), addr(B)), 1);
    assert_eq!(net.count(addr(A), addr(R1)), 1);
    assert_eq!(net.count(addr(A), addr(R2)), 1);

    net.pump();
    assert_eq!(
        paths(drain_messages(&mut bob_events)),
        vec![DeliveryPath::Direct, relay("r1"), relay("r2")]
    );
}

#[test]
fn always_send_reaches_unknown_hosts_through_relays() {
    let (net, alice, (_, mut bob_events)) = connected_pair();
    alice.remove_host("bob");

    assert_eq!(
        alice.send_message("bob", 3, b"x", DeliveryMode::DirectAndTurn),
        Err(SendError::UnknownHost("bob".into()))
    );
    let report = alice
        .send_message("bob", 3, b"x", DeliveryMode::AlwaysSend)
        .unwrap();
    assert_eq!(report, DeliveryReport { direct: 0, relayed: 2 });
    assert_eq!(net.count(addr(A), addr(B)), 0);

    net.pump();
    assert_eq!(drain_messages(&mut bob_events).len(), 2);
}

#[test]
fn control_id_is_refused_before_any_send() {
    let (net, alice, _) = connected_pair();

    for mode in [
        DeliveryMode::DirectOnly,
        DeliveryMode::TurnOnly,
        DeliveryMode::DirectAndTurn,
        DeliveryMode::AlwaysSend,
    ] {
        assert_eq!(
            alice.send_message("bob", 0, b"x", mode),
            Err(SendError::ReservedMessageId)
        );
    }
    assert_eq!(alice.broadcast_message(0, b"x"), Err(SendError::ReservedMessageId));
    assert_eq!(net.count(addr(A), addr(B)), 0);
    assert_eq!(net.count(addr(A), addr(R1)), 0);
    assert_eq!(net.count(addr(A), addr(R2)), 0);
}

#[test]
fn broadcast_fans_out_through_each_relay() {
    let (net, alice, (_, mut bob_events)) = connected_pair();

    assert_eq!(alice.broadcast_message(9, b"to all"), Ok(2));
    net.pump();
    assert_eq!(
        paths(drain_messages(&mut bob_events)),
        vec![
            DeliveryPath::Broadcast {
                relay_id: "r1".into()
            },
            DeliveryPath::Broadcast {
                relay_id: "r2".into()
            },
        ]
    );
}
