//! HNS integration test harness.
//!
//! Most tests run relays and switches over an in-memory network: every
//! node gets a sink that appends to one shared queue, and `pump` delivers
//! queued datagrams until the network is quiet. Nothing is asynchronous,
//! so each scenario is deterministic.
//!
//! `loopback` runs the real tokio runtimes over 127.0.0.1.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use hns_core::config::{RelayEndpoint, RelayPublicKey, SwitchConfig};
use hns_core::crypto::SecretKey;
use hns_core::net::DatagramSink;
use hns_relay::{Authorizer, ClientPolicy, RelayHandler, SessionDirectory};
use hns_switch::{SwitchCore, SwitchEvent};

mod delivery;
mod discovery;
mod loopback;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Stops a runaway exchange from hanging the test.
const MAX_DELIVERIES: usize = 100_000;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<Datagram>>,
    log: Mutex<Vec<Datagram>>,
}

/// The sink a node sends through. Stamps its own address as the source.
pub struct NodeSink {
    addr: SocketAddr,
    wire: Arc<Wire>,
}

impl DatagramSink for NodeSink {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        let datagram = Datagram {
            from: self.addr,
            to,
            bytes: datagram.to_vec(),
        };
        self.wire.log.lock().unwrap().push(datagram.clone());
        self.wire.queue.lock().unwrap().push_back(datagram);
        Ok(())
    }
}

pub struct Network {
    wire: Arc<Wire>,
    relays: HashMap<SocketAddr, Arc<RelayHandler>>,
    switches: HashMap<SocketAddr, Arc<SwitchCore>>,
    /// Drop switch-to-switch traffic, as between two strict NATs.
    direct_blocked: AtomicBool,
}

impl Network {
    pub fn new() -> Self {
        Self {
            wire: Arc::new(Wire::default()),
            relays: HashMap::new(),
            switches: HashMap::new(),
            direct_blocked: AtomicBool::new(false),
        }
    }

    fn sink(&self, addr: SocketAddr) -> Arc<dyn DatagramSink> {
        Arc::new(NodeSink {
            addr,
            wire: self.wire.clone(),
        })
    }

    /// Add a relay that admits everyone and lets every client broadcast.
    pub fn add_relay(&mut self, id: &str, addr: SocketAddr) -> RelayEndpoint {
        let policy = ClientPolicy::new();
        policy.apply_config(true, &[], &[], &[]);
        policy.allow_broadcast("alice");
        policy.allow_broadcast("bob");
        let authorizer: Arc<dyn Authorizer> = Arc::new(policy);
        let endpoint = relay_endpoint(id, addr);
        let handler = Arc::new(RelayHandler::new(
            endpoint.pre_shared_key.clone(),
            Arc::new(SessionDirectory::new()),
            authorizer,
            self.sink(addr),
            hns_core::wire::MAX_MESSAGE_PAYLOAD,
        ));
        self.relays.insert(addr, handler);
        endpoint
    }

    pub fn relay(&self, addr: SocketAddr) -> &Arc<RelayHandler> {
        &self.relays[&addr]
    }

    pub fn add_switch(
        &mut self,
        host_id: &str,
        addr: SocketAddr,
        relays: &[RelayEndpoint],
    ) -> (Arc<SwitchCore>, mpsc::UnboundedReceiver<SwitchEvent>) {
        let (core, events) = SwitchCore::new(&switch_config(host_id), addr, self.sink(addr)).unwrap();
        let core = Arc::new(core);
        self.switches.insert(addr, core.clone());
        for relay in relays {
            core.add_service(relay.clone());
        }
        (core, events)
    }

    pub fn block_direct(&self, blocked: bool) {
        self.direct_blocked.store(blocked, Ordering::Relaxed);
    }

    /// Deliver queued datagrams until none are left. Returns how many were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let Some(datagram) = self.wire.queue.lock().unwrap().pop_front() else {
                break;
            };
            if self.deliver(&datagram) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&self, datagram: &Datagram) -> bool {
        if let Some(relay) = self.relays.get(&datagram.to) {
            if let Some(pending) = relay.handle_datagram(&datagram.bytes, datagram.from) {
                relay.process_initialize(pending);
            }
            return true;
        }
        if let Some(core) = self.switches.get(&datagram.to) {
            let between_switches = self.switches.contains_key(&datagram.from);
            if between_switches && self.direct_blocked.load(Ordering::Relaxed) {
                return false;
            }
            core.handle_datagram(&datagram.bytes, datagram.from);
            return true;
        }
        false
    }

    pub fn clear_log(&self) {
        self.wire.log.lock().unwrap().clear();
    }

    /// Datagrams sent from `from` to `to` since the last `clear_log`.
    pub fn count(&self, from: SocketAddr, to: SocketAddr) -> usize {
        self.wire
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.from == from && d.to == to)
            .count()
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn relay_endpoint(id: &str, address: SocketAddr) -> RelayEndpoint {
    RelayEndpoint {
        id: id.into(),
        address,
        public_key: RelayPublicKey::from_modulus(vec![0xff; 256]).unwrap(),
        pre_shared_key: SecretKey::from_passphrase(&format!("{id} pre-shared key")),
    }
}

/// Short keep-alive so every test tick is due; long timeout so nothing goes stale.
pub fn switch_config(host_id: &str) -> SwitchConfig {
    SwitchConfig {
        host_id: host_id.into(),
        connection_timeout_ms: 60_000,
        keep_alive_interval_ms: 1,
        lan_broadcast: false,
        ..SwitchConfig::default()
    }
}

/// Every application message currently waiting on `events`.
pub fn drain_messages(events: &mut mpsc::UnboundedReceiver<SwitchEvent>) -> Vec<SwitchEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if matches!(event, SwitchEvent::Message { .. }) {
            out.push(event);
        }
    }
    out
}

/// Let a 1 ms keep-alive interval elapse between ticks.
pub fn next_round() {
    std::thread::sleep(Duration::from_millis(3));
}
