//! Host registry: remote peers of interest and their paths.
//!
//! The table owns every `Host`; each host owns its sessions. A direct
//! session refers back to its host by `HostKey`, and the table keeps a
//! local-session-id index so an inbound DirectMessage finds its host
//! without scanning.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hns_core::ids::SessionIdGenerator;

use crate::punch::PortSweep;

/// Stable handle for a host inside a `HostTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(u64);

/// One candidate direct UDP path to a host.
#[derive(Debug, Clone)]
pub struct DirectUdpSession {
    pub host: HostKey,
    /// Our id for this path. Peers put it in DirectMessages they send us.
    pub local_session_id: u64,
    /// The peer's id for this path. 0 until the handshake completes.
    pub remote_session_id: u64,
    pub address: SocketAddr,
    pub connected: bool,
    pub created_at: Instant,
    pub last_communicated: Option<Instant>,
    pub last_ping_sent: Option<Instant>,
    pub rtt: Option<Duration>,
}

impl DirectUdpSession {
    /// Usable for sending once the peer's session id is known.
    pub fn is_usable(&self) -> bool {
        self.remote_session_id != 0
    }

    fn is_fresh(&self, now: Instant, timeout: Duration) -> bool {
        self.last_communicated
            .is_some_and(|t| now.duration_since(t) <= timeout)
    }
}

/// A relayed path to a host through one relay.
#[derive(Debug, Clone)]
pub struct TurningUdpSession {
    pub relay_id: String,
    pub connected: bool,
    pub last_communicated: Instant,
}

#[derive(Debug)]
pub struct Host {
    pub key: HostKey,
    pub host_id: String,
    pub connected: bool,
    pub connected_direct: bool,
    pub connected_turn: bool,
    pub direct: Vec<DirectUdpSession>,
    pub turning: Vec<TurningUdpSession>,
    /// Addresses relays reported for this host.
    pub observed: BTreeSet<SocketAddr>,
    /// Addresses the host offered through address exchange.
    pub predicted: BTreeSet<SocketAddr>,
    /// Addresses that answered one of our pings.
    pub confirmed: BTreeSet<SocketAddr>,
    pub last_communicated: Option<Instant>,
    pub last_direct: Option<Instant>,
    pub last_turn: Option<Instant>,
    /// Last relay query, subnet ping and punch round.
    pub last_discovery: Option<Instant>,
    pub sweep: PortSweep,
}

impl Host {
    fn new(key: HostKey, host_id: String) -> Self {
        Self {
            key,
            host_id,
            connected: false,
            connected_direct: false,
            connected_turn: false,
            direct: Vec::new(),
            turning: Vec::new(),
            observed: BTreeSet::new(),
            predicted: BTreeSet::new(),
            confirmed: BTreeSet::new(),
            last_communicated: None,
            last_direct: None,
            last_turn: None,
            last_discovery: None,
            sweep: PortSweep::new(),
        }
    }

    pub fn direct_session(&self, address: SocketAddr) -> Option<&DirectUdpSession> {
        self.direct.iter().find(|s| s.address == address)
    }

    pub fn direct_session_mut(&mut self, address: SocketAddr) -> Option<&mut DirectUdpSession> {
        self.direct.iter_mut().find(|s| s.address == address)
    }

    /// The connected direct session heard from most recently.
    pub fn best_direct(&self) -> Option<&DirectUdpSession> {
        self.direct
            .iter()
            .filter(|s| s.connected && s.is_usable())
            .max_by_key(|s| s.last_communicated)
    }

    /// Record traffic through `relay_id`.
    pub fn touch_turning(&mut self, relay_id: &str, at: Instant) {
        match self.turning.iter_mut().find(|t| t.relay_id == relay_id) {
            Some(t) => {
                t.connected = true;
                t.last_communicated = at;
            }
            None => self.turning.push(TurningUdpSession {
                relay_id: relay_id.to_string(),
                connected: true,
                last_communicated: at,
            }),
        }
        self.last_turn = Some(self.last_turn.map_or(at, |t| t.max(at)));
        self.last_communicated = Some(self.last_communicated.map_or(at, |t| t.max(at)));
        self.connected_turn = true;
        self.connected = true;
    }

    pub fn disconnect_relay(&mut self, relay_id: &str) {
        for t in self.turning.iter_mut().filter(|t| t.relay_id == relay_id) {
            t.connected = false;
        }
        self.connected_turn = self.turning.iter().any(|t| t.connected);
        self.connected = self.connected_direct || self.connected_turn;
    }

    /// Recompute every connection flag from timestamps.
    pub fn refresh(&mut self, now: Instant, timeout: Duration) {
        for s in &mut self.direct {
            s.connected = s.is_usable() && s.is_fresh(now, timeout);
        }
        for t in &mut self.turning {
            if now.duration_since(t.last_communicated) > timeout {
                t.connected = false;
            }
        }
        self.connected_direct = self.direct.iter().any(|s| s.connected);
        self.connected_turn = self.turning.iter().any(|t| t.connected);
        self.connected = self.connected_direct || self.connected_turn;
    }

    /// Observed and predicted addresses, the targets for knocks and sweeps.
    pub fn candidates(&self) -> BTreeSet<SocketAddr> {
        self.observed.union(&self.predicted).copied().collect()
    }

    pub fn flags(&self) -> HostFlags {
        HostFlags {
            connected: self.connected,
            connected_direct: self.connected_direct,
            connected_turn: self.connected_turn,
        }
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            host_id: self.host_id.clone(),
            flags: self.flags(),
            direct_sessions: self.direct.len(),
            usable_direct_sessions: self.direct.iter().filter(|s| s.is_usable()).count(),
            turning_relays: self
                .turning
                .iter()
                .filter(|t| t.connected)
                .map(|t| t.relay_id.clone())
                .collect(),
            observed: self.observed.iter().copied().collect(),
            predicted: self.predicted.iter().copied().collect(),
            confirmed: self.confirmed.iter().copied().collect(),
            best_rtt: self.best_direct().and_then(|s| s.rtt),
            sweep_window: self.sweep.window(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFlags {
    pub connected: bool,
    pub connected_direct: bool,
    pub connected_turn: bool,
}

/// Point-in-time view of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub host_id: String,
    pub flags: HostFlags,
    pub direct_sessions: usize,
    pub usable_direct_sessions: usize,
    pub turning_relays: Vec<String>,
    pub observed: Vec<SocketAddr>,
    pub predicted: Vec<SocketAddr>,
    pub confirmed: Vec<SocketAddr>,
    pub best_rtt: Option<Duration>,
    pub sweep_window: u16,
}

#[derive(Debug, Default)]
pub struct HostTable {
    hosts: HashMap<HostKey, Host>,
    by_name: HashMap<String, HostKey>,
    direct_index: HashMap<u64, HostKey>,
    next_key: u64,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.by_name.contains_key(host_id)
    }

    /// Returns the host and whether it was just created.
    pub fn get_or_create(&mut self, host_id: &str) -> (&mut Host, bool) {
        let (key, created) = match self.by_name.get(host_id) {
            Some(key) => (*key, false),
            None => {
                self.next_key += 1;
                let key = HostKey(self.next_key);
                self.by_name.insert(host_id.to_string(), key);
                self.hosts.insert(key, Host::new(key, host_id.to_string()));
                tracing::debug!(host_id, "host added");
                (key, true)
            }
        };
        let host = self
            .hosts
            .entry(key)
            .or_insert_with(|| Host::new(key, host_id.to_string()));
        (host, created)
    }

    pub fn get(&self, host_id: &str) -> Option<&Host> {
        self.by_name.get(host_id).and_then(|k| self.hosts.get(k))
    }

    pub fn get_mut(&mut self, host_id: &str) -> Option<&mut Host> {
        let key = *self.by_name.get(host_id)?;
        self.hosts.get_mut(&key)
    }

    /// Drop a host and every session it owns.
    pub fn remove(&mut self, host_id: &str) -> Option<Host> {
        let key = self.by_name.remove(host_id)?;
        let host = self.hosts.remove(&key)?;
        for s in &host.direct {
            self.direct_index.remove(&s.local_session_id);
        }
        Some(host)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Host> {
        self.hosts.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Find the host owning local session `session_id`.
    pub fn by_session_mut(&mut self, session_id: u64) -> Option<&mut Host> {
        let key = *self.direct_index.get(&session_id)?;
        self.hosts.get_mut(&key)
    }

    /// The session for `(host_id, address)`, created if missing. Returns the
    /// local session id and whether it was created. Never creates a second
    /// session for the same pair.
    pub fn ensure_direct(
        &mut self,
        host_id: &str,
        address: SocketAddr,
        ids: &SessionIdGenerator,
        now: Instant,
    ) -> (u64, bool) {
        let (host, _) = self.get_or_create(host_id);
        if let Some(existing) = host.direct_session(address) {
            return (existing.local_session_id, false);
        }
        let key = host.key;
        let local_session_id = ids.next_id();
        host.direct.push(DirectUdpSession {
            host: key,
            local_session_id,
            remote_session_id: 0,
            address,
            connected: false,
            created_at: now,
            last_communicated: None,
            last_ping_sent: None,
            rtt: None,
        });
        self.direct_index.insert(local_session_id, key);
        tracing::debug!(
            host_id,
            peer = %address,
            session_id = hex::encode(local_session_id.to_be_bytes()),
            "direct session created"
        );
        (local_session_id, true)
    }

    /// Remove direct sessions that stayed silent past `max_idle`.
    pub fn prune_direct(&mut self, now: Instant, max_idle: Duration) -> usize {
        let mut dropped = Vec::new();
        for host in self.hosts.values_mut() {
            host.direct.retain(|s| {
                let since = s.last_communicated.unwrap_or(s.created_at);
                let keep = now.duration_since(since) <= max_idle;
                if !keep {
                    dropped.push(s.local_session_id);
                }
                keep
            });
        }
        for id in &dropped {
            self.direct_index.remove(id);
        }
        dropped.len()
    }

    pub fn remove_relay(&mut self, relay_id: &str) {
        for host in self.hosts.values_mut() {
            host.turning.retain(|t| t.relay_id != relay_id);
            host.connected_turn = host.turning.iter().any(|t| t.connected);
            host.connected = host.connected_direct || host.connected_turn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 2, 3], port))
    }

    #[test]
    fn get_or_create_is_lazy_and_unique() {
        let mut table = HostTable::new();
        let (_, created) = table.get_or_create("bob");
        assert!(created);
        let (_, created) = table.get_or_create("bob");
        assert!(!created);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ensure_direct_is_idempotent_per_address() {
        let ids = SessionIdGenerator::starting_at(1);
        let mut table = HostTable::new();
        let now = Instant::now();
        let (a, created_a) = table.ensure_direct("bob", addr(1), &ids, now);
        let (b, created_b) = table.ensure_direct("bob", addr(1), &ids, now);
        let (c, created_c) = table.ensure_direct("bob", addr(2), &ids, now);
        assert!(created_a && !created_b && created_c);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.get("bob").unwrap().direct.len(), 2);
        assert_eq!(table.by_session_mut(c).unwrap().host_id, "bob");
    }

    #[test]
    fn remove_drops_session_index() {
        let ids = SessionIdGenerator::starting_at(1);
        let mut table = HostTable::new();
        let (id, _) = table.ensure_direct("bob", addr(1), &ids, Instant::now());
        assert!(table.remove("bob").is_some());
        assert!(table.by_session_mut(id).is_none());
        assert!(table.get("bob").is_none());
    }

    #[test]
    fn refresh_needs_remote_id_and_recent_traffic() {
        let ids = SessionIdGenerator::starting_at(1);
        let mut table = HostTable::new();
        let now = Instant::now();
        table.ensure_direct("bob", addr(1), &ids, now);
        let host = table.get_mut("bob").unwrap();

        host.direct[0].last_communicated = Some(now);
        host.refresh(now, Duration::from_secs(1));
        assert!(!host.connected_direct, "no remote id yet");

        host.direct[0].remote_session_id = 99;
        host.refresh(now, Duration::from_secs(1));
        assert!(host.connected_direct && host.connected);

        host.refresh(now + Duration::from_secs(2), Duration::from_secs(1));
        assert!(!host.connected_direct && !host.connected);
    }

    #[test]
    fn turning_sessions_follow_relays() {
        let mut table = HostTable::new();
        let now = Instant::now();
        let (host, _) = table.get_or_create("bob");
        host.touch_turning("r1", now);
        host.touch_turning("r1", now);
        host.touch_turning("r2", now);
        assert_eq!(host.turning.len(), 2);
        assert!(host.connected_turn);

        host.disconnect_relay("r1");
        assert!(host.connected_turn);
        table.remove_relay("r2");
        let host = table.get("bob").unwrap();
        assert_eq!(host.turning.len(), 1);
        assert!(!host.connected_turn);
    }

    #[test]
    fn prune_forgets_silent_sessions() {
        let ids = SessionIdGenerator::starting_at(1);
        let mut table = HostTable::new();
        let start = Instant::now();
        let (id, _) = table.ensure_direct("bob", addr(1), &ids, start);
        assert_eq!(table.prune_direct(start, Duration::from_secs(5)), 0);
        assert_eq!(table.prune_direct(start + Duration::from_secs(6), Duration::from_secs(5)), 1);
        assert!(table.by_session_mut(id).is_none());
    }
}
