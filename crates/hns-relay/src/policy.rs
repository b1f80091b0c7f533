//! Client authorization for the relay.
//!
//! Three checks gate what a client may do:
//! - Session:   may this client id register at all (InitializeSession)
//! - Query:     may the requester learn the target's address (QueryHost)
//! - Broadcast: may the sender fan out to every registered client
//!
//! A denied session or broadcast gets no response. A denied query is
//! answered exactly like an unknown target.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use hns_core::config::RelayServiceConfig;

/// Authorization callbacks consulted by the relay.
///
/// `authorize_session` may block (it runs on a blocking worker, never on
/// the receive path). The other two are called inline and must be cheap.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize_session(&self, client_id: &str, certificate: &[u8], from: SocketAddr) -> bool;

    fn authorize_query(&self, _requester: &str, _target: &str) -> bool {
        true
    }

    fn authorize_broadcast(&self, _sender: &str) -> bool {
        false
    }
}

/// Trust level for a client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Never admitted.
    Blocked,
    /// Admitted only when auto-trust is on.
    #[default]
    Untrusted,
    /// Always admitted.
    Trusted,
}

/// Config-driven `Authorizer`. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ClientPolicy {
    rules: Arc<DashMap<String, TrustLevel>>,
    broadcasters: Arc<DashSet<String>>,
    auto_trust: Arc<AtomicBool>,
}

impl ClientPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RelayServiceConfig) -> Self {
        let policy = Self::new();
        policy.apply_config(
            config.auto_trust,
            &config.trusted_clients,
            &config.blocked_clients,
            &config.broadcast_clients,
        );
        policy
    }

    pub fn apply_config(
        &self,
        auto_trust: bool,
        trusted: &[String],
        blocked: &[String],
        broadcasters: &[String],
    ) {
        self.auto_trust.store(auto_trust, Ordering::Relaxed);
        for id in trusted {
            self.rules.insert(id.clone(), TrustLevel::Trusted);
            tracing::info!(client_id = %id, "pre-trusted client from config");
        }
        // Blocked wins over trusted when a client appears in both lists.
        for id in blocked {
            self.rules.insert(id.clone(), TrustLevel::Blocked);
            tracing::info!(client_id = %id, "blocked client from config");
        }
        for id in broadcasters {
            self.broadcasters.insert(id.clone());
        }
    }

    /// Returns Untrusted if no rule exists.
    pub fn check(&self, client_id: &str) -> TrustLevel {
        self.rules
            .get(client_id)
            .map(|r| *r.value())
            .unwrap_or_default()
    }

    pub fn trust(&self, client_id: &str) {
        self.rules.insert(client_id.to_string(), TrustLevel::Trusted);
        tracing::info!(client_id, "client trusted");
    }

    pub fn block(&self, client_id: &str) {
        self.rules.insert(client_id.to_string(), TrustLevel::Blocked);
        tracing::info!(client_id, "client blocked");
    }

    pub fn remove(&self, client_id: &str) {
        self.rules.remove(client_id);
    }

    pub fn allow_broadcast(&self, client_id: &str) {
        self.broadcasters.insert(client_id.to_string());
    }

    /// Blocked loses, then auto-trust or an explicit Trusted rule admits.
    pub fn is_admitted(&self, client_id: &str) -> bool {
        match self.check(client_id) {
            TrustLevel::Blocked => false,
            TrustLevel::Trusted => true,
            TrustLevel::Untrusted => self.auto_trust.load(Ordering::Relaxed),
        }
    }
}

impl Authorizer for ClientPolicy {
    fn authorize_session(&self, client_id: &str, _certificate: &[u8], from: SocketAddr) -> bool {
        let admitted = self.is_admitted(client_id);
        if !admitted {
            tracing::debug!(client_id, peer = %from, "session refused by policy");
        }
        admitted
    }

    fn authorize_query(&self, requester: &str, target: &str) -> bool {
        self.check(requester) != TrustLevel::Blocked && self.check(target) != TrustLevel::Blocked
    }

    fn authorize_broadcast(&self, sender: &str) -> bool {
        self.is_admitted(sender) && self.broadcasters.contains(sender)
    }
}
