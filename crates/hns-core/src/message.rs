//! Typed bodies for every method and sub-method.
//!
//! Each type knows how to write itself into a `ByteWriter` and parse itself
//! from a `ByteReader`. Parsing is strict: a truncated field, an unknown
//! sub-method, or trailing bytes rejects the whole body.

use std::net::SocketAddr;

use crate::crypto::SecretKey;
use crate::cursor::{ByteReader, ByteWriter};
use crate::wire::{
    ClientOp, ServiceOp, WireError, KEY_LEN, MAX_CERTIFICATE_LEN, MAX_MESSAGE_PAYLOAD,
};

fn finish(r: &ByteReader<'_>) -> Result<(), WireError> {
    match r.remaining() {
        0 => Ok(()),
        n => Err(WireError::TrailingBytes(n)),
    }
}

fn put_payload(w: &mut ByteWriter, data: &[u8]) -> Result<(), WireError> {
    if data.len() > MAX_MESSAGE_PAYLOAD {
        return Err(WireError::PayloadTooLarge(data.len()));
    }
    w.put_bytes(data);
    Ok(())
}

fn read_payload(r: &mut ByteReader<'_>) -> Result<Vec<u8>, WireError> {
    let data = r.bytes()?;
    if data.len() > MAX_MESSAGE_PAYLOAD {
        return Err(WireError::PayloadTooLarge(data.len()));
    }
    Ok(data.to_vec())
}

// ── Session establishment ─────────────────────────────────────────────────────

/// Plaintext of `InitializeSession`, sealed under the relay pre-shared key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRequest {
    /// Session secret proposed by the client for this session.
    pub secret: SecretKey,
    pub client_id: String,
    /// Opaque credential handed to the relay's authorization callback.
    pub certificate: Vec<u8>,
}

impl InitializeRequest {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_slice(self.secret.as_bytes());
        w.put_id(&self.client_id)?;
        if self.certificate.len() > MAX_CERTIFICATE_LEN {
            return Err(WireError::PayloadTooLarge(self.certificate.len()));
        }
        w.put_bytes(&self.certificate);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let mut secret = [0u8; KEY_LEN];
        secret.copy_from_slice(r.take(KEY_LEN)?);
        let client_id = r.id()?;
        let certificate = r.bytes()?;
        if certificate.len() > MAX_CERTIFICATE_LEN {
            return Err(WireError::PayloadTooLarge(certificate.len()));
        }
        let certificate = certificate.to_vec();
        finish(&r)?;
        Ok(Self {
            secret: SecretKey::from_bytes(secret),
            client_id,
            certificate,
        })
    }
}

/// Plaintext of `InitializeSessionResponse`, sealed under the session secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeResponse {
    pub session_id: u64,
    /// The client's public address as seen by the relay.
    pub observed: Option<SocketAddr>,
    pub server_time_ms: u64,
}

impl InitializeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.session_id);
        w.put_addr(self.observed);
        w.put_u64(self.server_time_ms);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = Self {
            session_id: r.u64()?,
            observed: r.addr()?,
            server_time_ms: r.u64()?,
        };
        finish(&r)?;
        Ok(out)
    }
}

// ── Client → service ──────────────────────────────────────────────────────────

/// Layer-2 requests a client sends inside `ClientData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    KeepAlive {
        sequence: u32,
        client_time_ms: u64,
    },
    QueryHost {
        target: String,
    },
    SendMessage {
        target: String,
        message_id: u32,
        data: Vec<u8>,
    },
    BroadcastMessage {
        message_id: u32,
        data: Vec<u8>,
    },
}

impl ClientRequest {
    pub fn op(&self) -> ClientOp {
        match self {
            ClientRequest::KeepAlive { .. } => ClientOp::KeepAlive,
            ClientRequest::QueryHost { .. } => ClientOp::QueryHost,
            ClientRequest::SendMessage { .. } => ClientOp::SendMessage,
            ClientRequest::BroadcastMessage { .. } => ClientOp::BroadcastMessage,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_u8(self.op() as u8);
        match self {
            ClientRequest::KeepAlive {
                sequence,
                client_time_ms,
            } => {
                w.put_u32(*sequence);
                w.put_u64(*client_time_ms);
            }
            ClientRequest::QueryHost { target } => w.put_id(target)?,
            ClientRequest::SendMessage {
                target,
                message_id,
                data,
            } => {
                w.put_id(target)?;
                w.put_u32(*message_id);
                put_payload(&mut w, data)?;
            }
            ClientRequest::BroadcastMessage { message_id, data } => {
                w.put_u32(*message_id);
                put_payload(&mut w, data)?;
            }
        }
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = match ClientOp::try_from(r.u8()?)? {
            ClientOp::KeepAlive => ClientRequest::KeepAlive {
                sequence: r.u32()?,
                client_time_ms: r.u64()?,
            },
            ClientOp::QueryHost => ClientRequest::QueryHost { target: r.id()? },
            ClientOp::SendMessage => ClientRequest::SendMessage {
                target: r.id()?,
                message_id: r.u32()?,
                data: read_payload(&mut r)?,
            },
            ClientOp::BroadcastMessage => ClientRequest::BroadcastMessage {
                message_id: r.u32()?,
                data: read_payload(&mut r)?,
            },
        };
        finish(&r)?;
        Ok(out)
    }
}

// ── Service → client ──────────────────────────────────────────────────────────

/// Layer-2 replies and deliveries a relay sends inside `ServiceData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    KeepAlive {
        sequence: u32,
        client_time_ms: u64,
        server_time_ms: u64,
        observed: Option<SocketAddr>,
    },
    QueryHostResponse {
        target: String,
        /// None when the target is unknown or the query was not authorized.
        address: Option<SocketAddr>,
        /// Milliseconds since the relay last heard from the target.
        age_ms: u64,
    },
    MessageToClient {
        source: String,
        message_id: u32,
        data: Vec<u8>,
    },
    BroadcastToClient {
        source: String,
        message_id: u32,
        data: Vec<u8>,
    },
}

impl ServiceReply {
    pub fn op(&self) -> ServiceOp {
        match self {
            ServiceReply::KeepAlive { .. } => ServiceOp::KeepAlive,
            ServiceReply::QueryHostResponse { .. } => ServiceOp::QueryHostResponse,
            ServiceReply::MessageToClient { .. } => ServiceOp::MessageToClient,
            ServiceReply::BroadcastToClient { .. } => ServiceOp::BroadcastToClient,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_u8(self.op() as u8);
        match self {
            ServiceReply::KeepAlive {
                sequence,
                client_time_ms,
                server_time_ms,
                observed,
            } => {
                w.put_u32(*sequence);
                w.put_u64(*client_time_ms);
                w.put_u64(*server_time_ms);
                w.put_addr(*observed);
            }
            ServiceReply::QueryHostResponse {
                target,
                address,
                age_ms,
            } => {
                w.put_id(target)?;
                w.put_addr(*address);
                w.put_u64(*age_ms);
            }
            ServiceReply::MessageToClient {
                source,
                message_id,
                data,
            }
            | ServiceReply::BroadcastToClient {
                source,
                message_id,
                data,
            } => {
                w.put_id(source)?;
                w.put_u32(*message_id);
                put_payload(&mut w, data)?;
            }
        }
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = match ServiceOp::try_from(r.u8()?)? {
            ServiceOp::KeepAlive => ServiceReply::KeepAlive {
                sequence: r.u32()?,
                client_time_ms: r.u64()?,
                server_time_ms: r.u64()?,
                observed: r.addr()?,
            },
            ServiceOp::QueryHostResponse => ServiceReply::QueryHostResponse {
                target: r.id()?,
                address: r.addr()?,
                age_ms: r.u64()?,
            },
            ServiceOp::MessageToClient => ServiceReply::MessageToClient {
                source: r.id()?,
                message_id: r.u32()?,
                data: read_payload(&mut r)?,
            },
            ServiceOp::BroadcastToClient => ServiceReply::BroadcastToClient {
                source: r.id()?,
                message_id: r.u32()?,
                data: read_payload(&mut r)?,
            },
        };
        finish(&r)?;
        Ok(out)
    }
}

// ── Switch ↔ switch ───────────────────────────────────────────────────────────

/// Direct handshake probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub source_id: String,
    pub target_id: String,
    /// Sender's local session id for this path, 0 if it has none yet.
    pub session_id: u64,
    pub send_time_ms: u64,
}

impl PingRequest {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_id(&self.source_id)?;
        w.put_id(&self.target_id)?;
        w.put_u64(self.session_id);
        w.put_u64(self.send_time_ms);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = Self {
            source_id: r.id()?,
            target_id: r.id()?,
            session_id: r.u64()?,
            send_time_ms: r.u64()?,
        };
        finish(&r)?;
        Ok(out)
    }
}

/// Direct handshake answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResponse {
    pub source_id: String,
    pub target_id: String,
    /// Responder's local session id for this path.
    pub session_id: u64,
    /// Echo of the request's send time.
    pub send_time_ms: u64,
    /// The requester's address as seen by the responder.
    pub observed: Option<SocketAddr>,
}

impl PingResponse {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_id(&self.source_id)?;
        w.put_id(&self.target_id)?;
        w.put_u64(self.session_id);
        w.put_u64(self.send_time_ms);
        w.put_addr(self.observed);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = Self {
            source_id: r.id()?,
            target_id: r.id()?,
            session_id: r.u64()?,
            send_time_ms: r.u64()?,
            observed: r.addr()?,
        };
        finish(&r)?;
        Ok(out)
    }
}

/// Application or control payload over an established direct session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    /// The receiver's local session id.
    pub session_id: u64,
    pub source_id: String,
    pub target_id: String,
    pub message_id: u32,
    pub content: Vec<u8>,
}

impl DirectMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = ByteWriter::new();
        w.put_u64(self.session_id);
        w.put_id(&self.source_id)?;
        w.put_id(&self.target_id)?;
        w.put_u32(self.message_id);
        put_payload(&mut w, &self.content)?;
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let out = Self {
            session_id: r.u64()?,
            source_id: r.id()?,
            target_id: r.id()?,
            message_id: r.u32()?,
            content: read_payload(&mut r)?,
        };
        finish(&r)?;
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
