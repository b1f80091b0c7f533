//! Session directory: every registered client, indexed by session id and
//! by client id.
//!
//! A client id maps to at most one session. Re-registering a known client
//! keeps its session id and refreshes secret, address and timestamp.
//!
//! Lock order is always `by_client` then `by_id`. Registration and expiry
//! both run under the client's `by_client` entry, so they cannot interleave
//! for the same client.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use hns_core::crypto::SecretKey;
use hns_core::ids::SessionIdGenerator;

/// A registered client's relay session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub session_id: u64,
    pub client_id: String,
    /// Secret the client proposed in its latest InitializeSession.
    pub secret: SecretKey,
    /// Last address a valid datagram arrived from.
    pub address: SocketAddr,
    pub last_seen: Instant,
}

/// Result of `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub session_id: u64,
    /// False when an existing session was refreshed.
    pub created: bool,
}

#[derive(Debug, Default)]
pub struct SessionDirectory {
    by_id: DashMap<u64, ClientSession>,
    by_client: DashMap<String, u64>,
    ids: SessionIdGenerator,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: SessionIdGenerator) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Create-or-update the session for `client_id`.
    pub fn register(&self, client_id: &str, secret: SecretKey, address: SocketAddr) -> Registration {
        match self.by_client.entry(client_id.to_string()) {
            Entry::Occupied(entry) => {
                let session_id = *entry.get();
                match self.by_id.get_mut(&session_id) {
                    Some(mut session) => {
                        session.secret = secret;
                        session.address = address;
                        session.last_seen = Instant::now();
                    }
                    None => {
                        self.by_id.insert(
                            session_id,
                            ClientSession {
                                session_id,
                                client_id: client_id.to_string(),
                                secret,
                                address,
                                last_seen: Instant::now(),
                            },
                        );
                    }
                }
                Registration {
                    session_id,
                    created: false,
                }
            }
            Entry::Vacant(entry) => {
                let session_id = self.ids.next_id();
                self.by_id.insert(
                    session_id,
                    ClientSession {
                        session_id,
                        client_id: client_id.to_string(),
                        secret,
                        address,
                        last_seen: Instant::now(),
                    },
                );
                entry.insert(session_id);
                Registration {
                    session_id,
                    created: true,
                }
            }
        }
    }

    pub fn get(&self, session_id: u64) -> Option<ClientSession> {
        self.by_id.get(&session_id).map(|s| s.value().clone())
    }

    pub fn find_by_client(&self, client_id: &str) -> Option<ClientSession> {
        let session_id = *self.by_client.get(client_id)?;
        self.get(session_id)
    }

    /// Record an authenticated datagram from `address`.
    pub fn touch(&self, session_id: u64, address: SocketAddr) -> bool {
        match self.by_id.get_mut(&session_id) {
            Some(mut session) => {
                session.address = address;
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot every session except `exclude`, for fan-out after the
    /// table locks are released.
    pub fn others(&self, exclude: u64) -> Vec<ClientSession> {
        self.by_id
            .iter()
            .filter(|s| *s.key() != exclude)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Remove sessions idle for at least `ttl`. Returns how many were removed.
    pub fn expire(&self, ttl: Duration) -> usize {
        let stale: Vec<(u64, String)> = self
            .by_id
            .iter()
            .filter(|s| s.last_seen.elapsed() >= ttl)
            .map(|s| (s.session_id, s.client_id.clone()))
            .collect();

        let mut removed = 0;
        for (session_id, client_id) in stale {
            if let Entry::Occupied(entry) = self.by_client.entry(client_id) {
                if *entry.get() != session_id {
                    continue;
                }
                let expired = self
                    .by_id
                    .remove_if(&session_id, |_, s| s.last_seen.elapsed() >= ttl)
                    .is_some();
                if expired {
                    entry.remove();
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
