//! Events a switch reports to its owner.

use std::net::SocketAddr;

/// How an inbound message reached us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPath {
    Direct,
    Relay { relay_id: String },
    /// Fan-out from a relay broadcast.
    Broadcast { relay_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    Message {
        host_id: String,
        message_id: u32,
        data: Vec<u8>,
        path: DeliveryPath,
    },
    RelayConnected {
        relay_id: String,
        observed: Option<SocketAddr>,
    },
    RelayLost {
        relay_id: String,
    },
}
