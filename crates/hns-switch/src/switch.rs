//! SwitchCore: relays, hosts, direct handshakes and delivery policy.
//!
//! The core is synchronous. A runtime feeds it every datagram that arrives
//! on the switch socket (`handle_datagram`) and ticks it on a timer
//! (`tick`). Both may run concurrently: relay clients and the host table sit
//! behind their own locks, and datagrams are collected under a lock and sent
//! after it is released.
//!
//! Direct handshake:
//!
//! ```text
//! A → B  PingRequest  { source A, target B, session_id = A's local id or 0 }
//! B → A  PingResponse { source B, target A, session_id = B's local id, observed }
//! ```
//!
//! Each side keeps one `DirectUdpSession` per (host, address) and records
//! the other side's id as its remote id. A DirectMessage carries the
//! receiver's local id.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use hns_core::config::{ConfigError, RelayEndpoint, SwitchConfig};
use hns_core::ids::SessionIdGenerator;
use hns_core::message::{DirectMessage, PingRequest, PingResponse};
use hns_core::net::{route_source_ip, send_or_log, unix_millis, DatagramSink};
use hns_core::packet;
use hns_core::wire::{Method, CONTROL_MESSAGE_ID, MAX_ID_LEN};

use crate::control::AddressExchange;
use crate::error::SendError;
use crate::events::{DeliveryPath, SwitchEvent};
use crate::host::{HostFlags, HostStatus, HostTable};
use crate::punch::{sweep_targets, KNOCK};
use crate::relay_client::{RelayClient, RelayClientSettings, RelayClientStatus, RelayEvent};

/// Direct sessions silent for this many connection timeouts are dropped.
const DIRECT_IDLE_FACTOR: u32 = 4;

/// Which paths `send_message` may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The best connected direct session only.
    DirectOnly,
    /// Every connected relayed path only.
    TurnOnly,
    /// Best direct session plus every connected relayed path.
    DirectAndTurn,
    /// Best direct session plus every configured relay, connected or not.
    AlwaysSend,
}

/// How many copies of a message went out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub direct: usize,
    pub relayed: usize,
}

impl DeliveryReport {
    pub fn total(&self) -> usize {
        self.direct + self.relayed
    }
}

#[derive(Debug, Clone)]
struct SwitchSettings {
    certificate: Vec<u8>,
    connection_timeout: Duration,
    keep_alive_interval: Duration,
    max_payload: usize,
    port_sweep_step: u16,
    port_sweep_max_offset: u16,
    lan_broadcast: bool,
}

pub struct SwitchCore {
    host_id: String,
    local_addr: SocketAddr,
    settings: RwLock<SwitchSettings>,
    relays: Mutex<BTreeMap<String, Arc<RelayClient>>>,
    hosts: Mutex<HostTable>,
    ids: SessionIdGenerator,
    sink: Arc<dyn DatagramSink>,
    events: mpsc::UnboundedSender<SwitchEvent>,
}

impl SwitchCore {
    /// Build a core for the socket bound at `local_addr`. Relays in the
    /// config are validated here but added by the caller via `add_service`.
    pub fn new(
        config: &SwitchConfig,
        local_addr: SocketAddr,
        sink: Arc<dyn DatagramSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SwitchEvent>), ConfigError> {
        config.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        let core = Self {
            host_id: config.host_id.clone(),
            local_addr,
            settings: RwLock::new(SwitchSettings {
                certificate: config.certificate.as_bytes().to_vec(),
                connection_timeout: config.connection_timeout(),
                keep_alive_interval: config.keep_alive_interval(),
                max_payload: config.max_payload,
                port_sweep_step: config.port_sweep_step,
                port_sweep_max_offset: config.port_sweep_max_offset,
                lan_broadcast: config.lan_broadcast,
            }),
            relays: Mutex::new(BTreeMap::new()),
            hosts: Mutex::new(HostTable::new()),
            ids: SessionIdGenerator::new(),
            sink,
            events,
        };
        Ok((core, rx))
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn settings(&self) -> SwitchSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn hosts(&self) -> MutexGuard<'_, HostTable> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relay_map(&self) -> MutexGuard<'_, BTreeMap<String, Arc<RelayClient>>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SwitchEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    fn send_all(&self, datagrams: Vec<(SocketAddr, Vec<u8>)>) {
        for (to, datagram) in datagrams {
            send_or_log(self.sink.as_ref(), &datagram, to);
        }
    }

    // ── Relays ───────────────────────────────────────────────────────────────

    /// Add (or replace) a relay and start connecting to it.
    pub fn add_service(&self, endpoint: RelayEndpoint) -> Arc<RelayClient> {
        let settings = self.settings();
        let relay_id = endpoint.id.clone();
        let client = Arc::new(RelayClient::new(
            endpoint,
            RelayClientSettings {
                client_id: self.host_id.clone(),
                certificate: settings.certificate,
                connection_timeout: settings.connection_timeout,
                keep_alive_interval: settings.keep_alive_interval,
            },
            self.sink.clone(),
        ));
        let replaced = self
            .relay_map()
            .insert(relay_id.clone(), client.clone())
            .is_some();
        if replaced {
            self.hosts().remove_relay(&relay_id);
        }
        tracing::info!(relay = %relay_id, addr = %client.address(), replaced, "relay added");
        client.connect();
        client
    }

    pub fn remove_service(&self, relay_id: &str) -> bool {
        let removed = self.relay_map().remove(relay_id).is_some();
        if removed {
            self.hosts().remove_relay(relay_id);
            tracing::info!(relay = %relay_id, "relay removed");
        }
        removed
    }

    /// Update timing for the switch and every relay it owns.
    pub fn set_intervals(&self, connection_timeout: Duration, keep_alive_interval: Duration) {
        {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            settings.connection_timeout = connection_timeout;
            settings.keep_alive_interval = keep_alive_interval;
        }
        for relay in self.relays() {
            relay.set_intervals(connection_timeout, keep_alive_interval);
        }
    }

    pub fn relays(&self) -> Vec<Arc<RelayClient>> {
        self.relay_map().values().cloned().collect()
    }

    pub fn relay(&self, relay_id: &str) -> Option<Arc<RelayClient>> {
        self.relay_map().get(relay_id).cloned()
    }

    pub fn relay_status(&self) -> Vec<RelayClientStatus> {
        self.relays().iter().map(|r| r.status()).collect()
    }

    // ── Hosts ────────────────────────────────────────────────────────────────

    /// Register interest in `host_id`. Returns true if it was new.
    pub fn add_host(&self, host_id: &str) -> bool {
        if !self.is_valid_peer_id(host_id) {
            tracing::debug!(host_id, "refusing invalid host id");
            return false;
        }
        self.hosts().get_or_create(host_id).1
    }

    pub fn get_host(&self, host_id: &str) -> Option<HostFlags> {
        self.hosts().get(host_id).map(|h| h.flags())
    }

    pub fn host_status(&self, host_id: &str) -> Option<HostStatus> {
        self.hosts().get(host_id).map(|h| h.status())
    }

    pub fn host_ids(&self) -> Vec<String> {
        self.hosts().iter().map(|h| h.host_id.clone()).collect()
    }

    /// Forget a host and every session it owns.
    pub fn remove_host(&self, host_id: &str) -> bool {
        let removed = self.hosts().remove(host_id).is_some();
        if removed {
            tracing::debug!(host_id, "host removed");
        }
        removed
    }

    fn is_valid_peer_id(&self, host_id: &str) -> bool {
        !host_id.is_empty() && host_id.len() <= MAX_ID_LEN && host_id != self.host_id
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Process one datagram received on the switch socket.
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(peer = %from, error = %e, len = datagram.len(), "dropping datagram");
                return;
            }
        };

        match packet.method {
            Method::InitializeSessionResponse | Method::ServiceData | Method::Error => {
                let relay = self
                    .relays()
                    .into_iter()
                    .find(|r| r.address() == from);
                let Some(relay) = relay else {
                    tracing::debug!(peer = %from, "relay packet from unknown address");
                    return;
                };
                if let Some(event) = relay.process_received_packet(from, packet.method, &packet.body) {
                    self.on_relay_event(&relay, event);
                }
            }
            Method::PingRequest => self.on_ping_request(&packet.body, from),
            Method::PingResponse => self.on_ping_response(&packet.body, from),
            Method::DirectMessage => self.on_direct_message(&packet.body, from),
            other => tracing::debug!(peer = %from, method = ?other, "unexpected method at switch"),
        }
    }

    fn on_relay_event(&self, relay: &RelayClient, event: RelayEvent) {
        let relay_id = relay.relay_id().to_string();
        match event {
            RelayEvent::Connected { observed, .. } => {
                // Query every host on the next tick instead of waiting a full interval.
                for host in self.hosts().iter_mut() {
                    host.last_discovery = None;
                }
                self.emit(SwitchEvent::RelayConnected { relay_id, observed });
            }
            RelayEvent::KeepAlive { rtt, .. } => {
                tracing::trace!(relay = %relay_id, rtt_ms = rtt.as_millis() as u64, "relay keep-alive");
            }
            RelayEvent::HostResolved {
                host_id,
                address,
                age,
            } => self.on_host_resolved(&relay_id, host_id, address, age),
            RelayEvent::Message {
                source,
                message_id,
                data,
                broadcast,
            } => {
                if !self.is_valid_peer_id(&source) {
                    return;
                }
                {
                    let mut hosts = self.hosts();
                    let (host, _) = hosts.get_or_create(&source);
                    host.touch_turning(&relay_id, Instant::now());
                }
                if message_id == CONTROL_MESSAGE_ID {
                    self.on_control(&source, &data, Some(relay));
                    return;
                }
                let path = if broadcast {
                    DeliveryPath::Broadcast { relay_id }
                } else {
                    DeliveryPath::Relay { relay_id }
                };
                self.emit(SwitchEvent::Message {
                    host_id: source,
                    message_id,
                    data,
                    path,
                });
            }
            RelayEvent::Reset => {
                for host in self.hosts().iter_mut() {
                    host.disconnect_relay(&relay_id);
                }
                self.emit(SwitchEvent::RelayLost { relay_id });
            }
        }
    }

    fn on_host_resolved(
        &self,
        relay_id: &str,
        host_id: String,
        address: Option<SocketAddr>,
        age: Duration,
    ) {
        if !self.is_valid_peer_id(&host_id) {
            return;
        }
        let Some(address) = address else {
            tracing::debug!(relay = %relay_id, host_id = %host_id, "relay does not know host");
            return;
        };
        let settings = self.settings();
        let now = Instant::now();
        let ping = {
            let mut hosts = self.hosts();
            let (host, _) = hosts.get_or_create(&host_id);
            host.observed.insert(address);
            if age <= settings.connection_timeout {
                host.touch_turning(relay_id, now.checked_sub(age).unwrap_or(now));
            }
            let (session_id, created) = hosts.ensure_direct(&host_id, address, &self.ids, now);
            if created {
                self.mark_pinged(&mut hosts, &host_id, address, now);
                self.ping_datagram(&host_id, session_id)
            } else {
                None
            }
        };
        tracing::debug!(relay = %relay_id, host_id = %host_id, peer = %address, "host resolved");
        if let Some(ping) = ping {
            self.send_all(vec![(address, ping)]);
        }
    }

    fn mark_pinged(&self, hosts: &mut HostTable, host_id: &str, address: SocketAddr, now: Instant) {
        if let Some(session) = hosts
            .get_mut(host_id)
            .and_then(|h| h.direct_session_mut(address))
        {
            session.last_ping_sent = Some(now);
        }
    }

    fn ping_datagram(&self, target_id: &str, session_id: u64) -> Option<Vec<u8>> {
        let ping = PingRequest {
            source_id: self.host_id.clone(),
            target_id: target_id.to_string(),
            session_id,
            send_time_ms: unix_millis(),
        };
        let body = ping.encode().ok()?;
        packet::encode(Method::PingRequest, &body).ok()
    }

    fn on_ping_request(&self, body: &[u8], from: SocketAddr) {
        let request = match PingRequest::decode(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "malformed PingRequest");
                return;
            }
        };
        if request.target_id != self.host_id || !self.is_valid_peer_id(&request.source_id) {
            tracing::trace!(peer = %from, target = %request.target_id, "PingRequest not for us");
            return;
        }

        let timeout = self.settings().connection_timeout;
        let now = Instant::now();
        let response = {
            let mut hosts = self.hosts();
            let (local_id, _) = hosts.ensure_direct(&request.source_id, from, &self.ids, now);
            let Some(host) = hosts.get_mut(&request.source_id) else {
                return;
            };
            if let Some(session) = host.direct_session_mut(from) {
                if request.session_id != 0 {
                    session.remote_session_id = request.session_id;
                }
                session.last_communicated = Some(now);
            }
            host.last_direct = Some(now);
            host.last_communicated = Some(now);
            host.refresh(now, timeout);
            PingResponse {
                source_id: self.host_id.clone(),
                target_id: request.source_id.clone(),
                session_id: local_id,
                send_time_ms: request.send_time_ms,
                observed: Some(from),
            }
        };

        match response
            .encode()
            .and_then(|b| packet::encode(Method::PingResponse, &b))
        {
            Ok(datagram) => self.send_all(vec![(from, datagram)]),
            Err(e) => tracing::debug!(error = %e, "cannot encode PingResponse"),
        }
    }

    fn on_ping_response(&self, body: &[u8], from: SocketAddr) {
        let response = match PingResponse::decode(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "malformed PingResponse");
                return;
            }
        };
        if response.target_id != self.host_id
            || response.session_id == 0
            || !self.is_valid_peer_id(&response.source_id)
        {
            tracing::trace!(peer = %from, "PingResponse not for us");
            return;
        }

        let timeout = self.settings().connection_timeout;
        let now = Instant::now();
        let rtt = Duration::from_millis(unix_millis().saturating_sub(response.send_time_ms));
        let follow_up = {
            let mut hosts = self.hosts();
            let (local_id, created) =
                hosts.ensure_direct(&response.source_id, from, &self.ids, now);
            let Some(host) = hosts.get_mut(&response.source_id) else {
                return;
            };
            let was_direct = host.connected_direct;
            if let Some(session) = host.direct_session_mut(from) {
                session.remote_session_id = response.session_id;
                session.last_communicated = Some(now);
                session.rtt = Some(rtt);
                if created {
                    session.last_ping_sent = Some(now);
                }
            }
            host.confirmed.insert(from);
            host.sweep.reset();
            host.last_direct = Some(now);
            host.last_communicated = Some(now);
            host.refresh(now, timeout);
            if host.connected_direct && !was_direct {
                tracing::info!(
                    host_id = %response.source_id,
                    peer = %from,
                    rtt_ms = rtt.as_millis() as u64,
                    "direct path established"
                );
            }
            // The peer learns our id for this path from our next ping.
            created.then(|| self.ping_datagram(&response.source_id, local_id)).flatten()
        };
        if let Some(ping) = follow_up {
            self.send_all(vec![(from, ping)]);
        }
    }

    fn on_direct_message(&self, body: &[u8], from: SocketAddr) {
        let message = match DirectMessage::decode(body) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "malformed DirectMessage");
                return;
            }
        };
        if message.target_id != self.host_id {
            tracing::debug!(peer = %from, "DirectMessage not for us");
            return;
        }

        let timeout = self.settings().connection_timeout;
        let now = Instant::now();
        {
            let mut hosts = self.hosts();
            let Some(host) = hosts.by_session_mut(message.session_id) else {
                tracing::debug!(peer = %from, "DirectMessage for unknown session");
                return;
            };
            if host.host_id != message.source_id {
                tracing::debug!(peer = %from, claimed = %message.source_id, "DirectMessage source mismatch");
                return;
            }
            let Some(session) = host
                .direct
                .iter_mut()
                .find(|s| s.local_session_id == message.session_id)
            else {
                return;
            };
            if session.address != from {
                tracing::debug!(peer = %from, expected = %session.address, "DirectMessage from wrong address");
                return;
            }
            session.last_communicated = Some(now);
            host.last_direct = Some(now);
            host.last_communicated = Some(now);
            host.refresh(now, timeout);
        }

        if message.message_id == CONTROL_MESSAGE_ID {
            self.on_control(&message.source_id, &message.content, None);
            return;
        }
        self.emit(SwitchEvent::Message {
            host_id: message.source_id,
            message_id: message.message_id,
            data: message.content,
            path: DeliveryPath::Direct,
        });
    }

    // ── Address exchange ─────────────────────────────────────────────────────

    /// Addresses we tell peers to try: our bound address, plus every public
    /// address a relay has reported for us. An unspecified bind is replaced
    /// by the local IP routed toward each relay, so peers on the same LAN
    /// learn an address they can reach without the NAT.
    pub fn advertised_addresses(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        let mut add = |addr: SocketAddr| {
            if !out.contains(&addr) {
                out.push(addr);
            }
        };
        let relays = self.relays();
        if self.local_addr.ip().is_unspecified() {
            for relay in &relays {
                match route_source_ip(relay.address()) {
                    Ok(ip) if !ip.is_unspecified() => {
                        add(SocketAddr::new(ip, self.local_addr.port()))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::trace!(relay = relay.relay_id(), error = %e, "no route toward relay")
                    }
                }
            }
        } else {
            add(self.local_addr);
        }
        for relay in &relays {
            if let Some(observed) = relay.observed_address() {
                add(observed);
            }
        }
        out
    }

    /// `via` is the relay the message came through, or None for direct.
    fn on_control(&self, host_id: &str, data: &[u8], via: Option<&RelayClient>) {
        let exchange = match AddressExchange::decode(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(host_id, error = %e, "malformed control message");
                return;
            }
        };
        {
            let mut hosts = self.hosts();
            let (host, _) = hosts.get_or_create(host_id);
            for addr in exchange.addresses() {
                if !addr.ip().is_unspecified() && addr.port() != 0 {
                    host.predicted.insert(*addr);
                }
            }
        }
        tracing::debug!(host_id, count = exchange.addresses().len(), "address exchange");

        if let AddressExchange::Request(_) = exchange {
            let reply = AddressExchange::Response(self.advertised_addresses()).encode();
            let result = match via {
                Some(relay) => relay.send_message(host_id, CONTROL_MESSAGE_ID, &reply),
                None => self
                    .deliver(host_id, CONTROL_MESSAGE_ID, &reply, DeliveryMode::DirectOnly)
                    .map(|_| ()),
            };
            if let Err(e) = result {
                tracing::debug!(host_id, error = %e, "address exchange reply not sent");
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Send an application message. `message_id` 0 is reserved.
    pub fn send_message(
        &self,
        host_id: &str,
        message_id: u32,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<DeliveryReport, SendError> {
        if message_id == CONTROL_MESSAGE_ID {
            return Err(SendError::ReservedMessageId);
        }
        let limit = self.settings().max_payload;
        if data.len() > limit {
            return Err(SendError::PayloadTooLarge {
                len: data.len(),
                limit,
            });
        }
        self.deliver(host_id, message_id, data, mode)
    }

    /// Broadcast through every connected relay. Returns how many accepted it.
    pub fn broadcast_message(&self, message_id: u32, data: &[u8]) -> Result<usize, SendError> {
        if message_id == CONTROL_MESSAGE_ID {
            return Err(SendError::ReservedMessageId);
        }
        let sent = self
            .relays()
            .iter()
            .filter(|r| r.broadcast_message(message_id, data).is_ok())
            .count();
        if sent == 0 {
            return Err(SendError::NotConnected);
        }
        Ok(sent)
    }

    fn deliver(
        &self,
        host_id: &str,
        message_id: u32,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<DeliveryReport, SendError> {
        let (direct, turn_relays) = {
            let hosts = self.hosts();
            match hosts.get(host_id) {
                None if mode != DeliveryMode::AlwaysSend => {
                    return Err(SendError::UnknownHost(host_id.to_string()))
                }
                None => (None, Vec::new()),
                Some(host) => {
                    let direct = match mode {
                        DeliveryMode::TurnOnly => None,
                        _ => host.best_direct().map(|s| (s.address, s.remote_session_id)),
                    };
                    let turn_relays: Vec<String> = match mode {
                        DeliveryMode::TurnOnly | DeliveryMode::DirectAndTurn => host
                            .turning
                            .iter()
                            .filter(|t| t.connected)
                            .map(|t| t.relay_id.clone())
                            .collect(),
                        _ => Vec::new(),
                    };
                    (direct, turn_relays)
                }
            }
        };

        let mut report = DeliveryReport::default();

        if let Some((address, remote_session_id)) = direct {
            let message = DirectMessage {
                session_id: remote_session_id,
                source_id: self.host_id.clone(),
                target_id: host_id.to_string(),
                message_id,
                content: data.to_vec(),
            };
            let datagram = packet::encode(Method::DirectMessage, &message.encode()?)?;
            if send_or_log(self.sink.as_ref(), &datagram, address) {
                report.direct += 1;
            }
        }

        let relays: Vec<Arc<RelayClient>> = match mode {
            DeliveryMode::AlwaysSend => self.relays(),
            DeliveryMode::DirectOnly => Vec::new(),
            DeliveryMode::TurnOnly | DeliveryMode::DirectAndTurn => {
                let map = self.relay_map();
                turn_relays.iter().filter_map(|id| map.get(id).cloned()).collect()
            }
        };
        for relay in relays {
            match relay.send_message(host_id, message_id, data) {
                Ok(()) => report.relayed += 1,
                Err(e) => tracing::debug!(relay = %relay.relay_id(), host_id, error = %e, "relay send skipped"),
            }
        }

        if report.total() == 0 {
            return Err(SendError::NotConnected);
        }
        Ok(report)
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// One maintenance pass: relay upkeep, host flags, re-pings, discovery,
    /// and hole punching.
    pub fn tick_at(&self, now: Instant) {
        for relay in self.relays() {
            if let Some(event) = relay.run_step() {
                self.on_relay_event(&relay, event);
            }
        }

        let settings = self.settings();
        let mut datagrams: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut discover: Vec<(String, bool)> = Vec::new();
        let mut to_open: Vec<(String, SocketAddr)> = Vec::new();

        {
            let mut hosts = self.hosts();
            let pruned = hosts.prune_direct(now, settings.connection_timeout * DIRECT_IDLE_FACTOR);
            if pruned > 0 {
                tracing::debug!(pruned, "dropped silent direct sessions");
            }

            for host in hosts.iter_mut() {
                host.refresh(now, settings.connection_timeout);

                for session in host.direct.iter_mut() {
                    let due = session
                        .last_ping_sent
                        .map_or(true, |t| now.duration_since(t) >= settings.keep_alive_interval);
                    if due {
                        session.last_ping_sent = Some(now);
                        if let Some(ping) = self.ping_datagram(&host.host_id, session.local_session_id) {
                            datagrams.push((session.address, ping));
                        }
                    }
                }

                let discovery_due = host
                    .last_discovery
                    .map_or(true, |t| now.duration_since(t) >= settings.keep_alive_interval);
                if !discovery_due {
                    continue;
                }
                host.last_discovery = Some(now);
                discover.push((host.host_id.clone(), host.connected_direct));

                if settings.lan_broadcast {
                    if let (IpAddr::V4(_), Some(ping)) =
                        (self.local_addr.ip(), self.ping_datagram(&host.host_id, 0))
                    {
                        datagrams.push((
                            SocketAddr::from((Ipv4Addr::BROADCAST, self.local_addr.port())),
                            ping,
                        ));
                    }
                }

                for candidate in &host.observed {
                    datagrams.push((*candidate, KNOCK.to_vec()));
                }

                if host.connected_direct {
                    host.sweep.reset();
                    continue;
                }

                let window = host.sweep.window();
                for candidate in host.candidates() {
                    if host.direct_session(candidate).is_none() {
                        to_open.push((host.host_id.clone(), candidate));
                    }
                    for target in sweep_targets(candidate, window).into_iter().skip(1) {
                        if let Some(ping) = self.ping_datagram(&host.host_id, 0) {
                            datagrams.push((target, ping));
                        }
                    }
                }
                host.sweep
                    .advance(settings.port_sweep_step, settings.port_sweep_max_offset);
            }

            for (host_id, address) in to_open {
                let (session_id, _) = hosts.ensure_direct(&host_id, address, &self.ids, now);
                self.mark_pinged(&mut hosts, &host_id, address, now);
                if let Some(ping) = self.ping_datagram(&host_id, session_id) {
                    datagrams.push((address, ping));
                }
            }
        }

        self.send_all(datagrams);

        if discover.is_empty() {
            return;
        }
        let connected: Vec<Arc<RelayClient>> =
            self.relays().into_iter().filter(|r| r.is_connected()).collect();
        if connected.is_empty() {
            return;
        }
        let offer = AddressExchange::Request(self.advertised_addresses()).encode();
        for (host_id, direct) in discover {
            for relay in &connected {
                relay.query_host(&host_id);
                if !direct {
                    if let Err(e) = relay.send_message(&host_id, CONTROL_MESSAGE_ID, &offer) {
                        tracing::debug!(relay = %relay.relay_id(), host_id = %host_id, error = %e, "address offer not sent");
                    }
                }
            }
        }
    }
}
