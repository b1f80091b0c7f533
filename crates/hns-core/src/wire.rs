//! HNS wire format: method ids, the outer datagram header, and limits.
//!
//! Every UDP datagram exchanged by a relay, a relay client, or two switches
//! starts with the same 8-byte header:
//!
//! ```text
//! bytes[0:4]  checksum   first 4 bytes of SHA-256(bytes[4..]), little-endian
//! bytes[4:8]  word       (28-bit random nonce << 4) | 4-bit method id
//! bytes[8..]  body       method specific
//! ```
//!
//! Changing any id or size here is a breaking protocol change.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Header ────────────────────────────────────────────────────────────────────

/// Outer header shared by every datagram.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketHeader {
    /// Truncated SHA-256 over everything after this field.
    pub checksum: U32<LittleEndian>,
    /// Nonce in the high 28 bits, method id in the low 4.
    pub word: U32<LittleEndian>,
}

assert_eq_size!(PacketHeader, [u8; HEADER_LEN]);

impl PacketHeader {
    pub fn method_bits(&self) -> u8 {
        (self.word.get() & 0xf) as u8
    }

    pub fn nonce(&self) -> u32 {
        self.word.get() >> 4
    }
}

// ── Methods ───────────────────────────────────────────────────────────────────

/// Layer-1 method id, carried in the low 4 bits of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    /// Client → service. Body sealed under the relay pre-shared key.
    InitializeSession = 1,
    /// Service → client. Body sealed under the client's fresh session secret.
    InitializeSessionResponse = 2,
    /// Client → service. Plaintext session id, then a sealed `ClientRequest`.
    ClientData = 3,
    /// Service → client. Plaintext session id, then a sealed `ServiceReply`.
    ServiceData = 4,
    /// Service → client. Plaintext session id; tells the client to reconnect.
    Error = 5,
    /// Switch ↔ switch, obfuscated.
    PingRequest = 8,
    /// Switch ↔ switch, obfuscated.
    PingResponse = 9,
    /// Switch ↔ switch, obfuscated.
    DirectMessage = 10,
}

impl Method {
    /// Direct methods are XOR-obfuscated with the header word.
    pub fn is_direct(self) -> bool {
        matches!(
            self,
            Method::PingRequest | Method::PingResponse | Method::DirectMessage
        )
    }
}

impl TryFrom<u8> for Method {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Method::InitializeSession),
            2 => Ok(Method::InitializeSessionResponse),
            3 => Ok(Method::ClientData),
            4 => Ok(Method::ServiceData),
            5 => Ok(Method::Error),
            8 => Ok(Method::PingRequest),
            9 => Ok(Method::PingResponse),
            10 => Ok(Method::DirectMessage),
            other => Err(WireError::UnknownMethod(other)),
        }
    }
}

impl From<Method> for u8 {
    fn from(m: Method) -> u8 {
        m as u8
    }
}

/// Layer-2 sub-method of a `ClientData` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    KeepAlive = 1,
    QueryHost = 2,
    SendMessage = 3,
    BroadcastMessage = 4,
}

impl TryFrom<u8> for ClientOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(ClientOp::KeepAlive),
            2 => Ok(ClientOp::QueryHost),
            3 => Ok(ClientOp::SendMessage),
            4 => Ok(ClientOp::BroadcastMessage),
            other => Err(WireError::UnknownSubMethod(other)),
        }
    }
}

/// Layer-2 sub-method of a `ServiceData` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceOp {
    KeepAlive = 1,
    QueryHostResponse = 2,
    MessageToClient = 3,
    BroadcastToClient = 4,
}

impl TryFrom<u8> for ServiceOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(ServiceOp::KeepAlive),
            2 => Ok(ServiceOp::QueryHostResponse),
            3 => Ok(ServiceOp::MessageToClient),
            4 => Ok(ServiceOp::BroadcastToClient),
            other => Err(WireError::UnknownSubMethod(other)),
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Outer header length.
pub const HEADER_LEN: usize = 8;

/// AES-CBC initialisation vector length, prepended to every sealed body.
pub const IV_LEN: usize = 16;

/// Truncated SHA-256 integrity tag at the front of every sealed plaintext.
pub const TAG_LEN: usize = 4;

/// Symmetric key and session secret length.
pub const KEY_LEN: usize = 32;

/// Largest datagram we build or accept. Fits an Ethernet MTU without
/// fragmentation.
pub const MAX_PACKET_SIZE: usize = 1472;

/// Upper bound on a single application message payload. Leaves room for ids,
/// tags, IV and CBC padding inside `MAX_PACKET_SIZE`.
pub const MAX_MESSAGE_PAYLOAD: usize = 1152;

/// Longest client/host id accepted on the wire.
pub const MAX_ID_LEN: usize = 64;

/// Longest opaque client certificate accepted in InitializeSession.
pub const MAX_CERTIFICATE_LEN: usize = 1024;

/// Message id reserved for switch control traffic.
pub const CONTROL_MESSAGE_ID: u32 = 0;

/// Default UDP port for a relay service.
pub const DEFAULT_RELAY_PORT: u16 = 7723;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Structural problems with a body. Any of these aborts parsing and the
/// datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("field needs {needed} bytes, only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("varint longer than 64 bits")]
    VarintOverflow,

    #[error("id of {0} bytes exceeds maximum {MAX_ID_LEN}")]
    IdTooLong(usize),

    #[error("id is not valid utf-8")]
    InvalidUtf8,

    #[error("unknown address family: {0}")]
    UnknownAddressFamily(u8),

    #[error("unknown method id: 0x{0:x}")]
    UnknownMethod(u8),

    #[error("unknown sub-method: 0x{0:02x}")]
    UnknownSubMethod(u8),

    #[error("packet of {0} bytes exceeds maximum {MAX_PACKET_SIZE}")]
    PacketTooLarge(usize),

    #[error("payload of {0} bytes exceeds maximum {MAX_MESSAGE_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
