//! Errors returned to callers that try to send.

use hns_core::wire::WireError;

/// Why a send was refused before anything reached the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("message id 0 is reserved for control traffic")]
    ReservedMessageId,

    #[error("payload of {len} bytes exceeds limit {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("no connected path")]
    NotConnected,

    #[error("unknown host {0:?}")]
    UnknownHost(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}
