use crate::*;

use std::time::Instant;

use anyhow::{bail, Context, Result};
use hns_core::config::{RelayEndpointConfig, RelayServiceConfig};
use hns_relay::RelayService;
use hns_switch::{DeliveryMode, DeliveryPath, Switch};

const RELAY_SECRET: &str = "loopback relay secret";

fn relay_config() -> RelayServiceConfig {
    RelayServiceConfig {
        bind: addr("127.0.0.1:0"),
        secret: RELAY_SECRET.into(),
        public_key: hex::encode([0xffu8; 256]),
        ..RelayServiceConfig::default()
    }
}

fn peer_config(host_id: &str, relay: SocketAddr) -> SwitchConfig {
    SwitchConfig {
        host_id: host_id.into(),
        connection_timeout_ms: 2_000,
        keep_alive_interval_ms: 50,
        maintenance_interval_ms: 10,
        lan_broadcast: false,
        relays: vec![RelayEndpointConfig {
            id: "local".into(),
            address: relay.to_string(),
            public_key: hex::encode([0xffu8; 256]),
            secret: RELAY_SECRET.into(),
        }],
        ..SwitchConfig::default()
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<SwitchEvent>) -> Result<SwitchEvent> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .context("no message within 10s")?
            .context("event channel closed")?;
        if matches!(event, SwitchEvent::Message { .. }) {
            return Ok(event);
        }
    }
}

#[tokio::test]
async fn peers_connect_directly_over_loopback() -> Result<()> {
    let policy = ClientPolicy::new();
    policy.apply_config(true, &[], &[], &[]);
    let relay = RelayService::start(&relay_config(), Arc::new(policy)).await?;

    let mut alice_config = peer_config("alice", relay.local_addr());
    alice_config.hosts = vec!["bob".into()];
    let (alice, _) = Switch::start_on(&alice_config, addr("127.0.0.1:0")).await?;
    let (bob, mut bob_events) =
        Switch::start_on(&peer_config("bob", relay.local_addr()), addr("127.0.0.1:0")).await?;

    wait_until("relay registrations", || relay.directory().len() == 2).await?;
    wait_until("direct path", || {
        alice
            .core()
            .get_host("bob")
            .is_some_and(|flags| flags.connected_direct)
    })
    .await?;

    alice
        .core()
        .send_message("bob", 42, b"over loopback", DeliveryMode::DirectOnly)?;
    assert_eq!(
        next_message(&mut bob_events).await?,
        SwitchEvent::Message {
            host_id: "alice".into(),
            message_id: 42,
            data: b"over loopback".to_vec(),
            path: DeliveryPath::Direct,
        }
    );

    alice.stop().await;
    bob.stop().await;
    relay.stop().await;
    assert_eq!(relay.status().await.sessions, 2);
    assert!(!relay.status().await.running);
    Ok(())
}
