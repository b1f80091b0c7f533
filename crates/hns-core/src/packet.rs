//! Datagram envelope: checksum, method/nonce word, optional obfuscation.
//!
//! Encode reserves the header, writes the body (XOR-obfuscated for direct
//! methods), computes the checksum over everything after the checksum field,
//! and patches the header. Decode mirrors it and rejects anything shorter
//! than a header or with a bad checksum. Rejection is routine: callers drop
//! the datagram and move on.

use thiserror::Error;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes};

use crate::crypto::{checksum32, open, random_nonce, seal, CryptoError, SecretKey};
use crate::cursor::{ByteReader, ByteWriter};
use crate::wire::{Method, PacketHeader, WireError, HEADER_LEN, MAX_PACKET_SIZE};

/// A decoded datagram: method and de-obfuscated body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub method: Method,
    pub body: Vec<u8>,
}

/// Build a datagram with a fresh random nonce.
pub fn encode(method: Method, body: &[u8]) -> Result<Vec<u8>, WireError> {
    encode_with_nonce(method, random_nonce(), body)
}

/// Build a datagram with an explicit 28-bit nonce.
pub fn encode_with_nonce(method: Method, nonce: u32, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let total = HEADER_LEN + body.len();
    if total > MAX_PACKET_SIZE {
        return Err(WireError::PacketTooLarge(total));
    }

    let word = ((nonce & 0x0fff_ffff) << 4) | u32::from(u8::from(method));
    let mut out = ByteWriter::with_capacity(total);
    out.put_slice(
        PacketHeader {
            checksum: U32::new(0),
            word: U32::new(word),
        }
        .as_bytes(),
    );
    out.put_slice(body);

    let bytes = out.as_mut_slice();
    if method.is_direct() {
        obfuscate(word, &mut bytes[HEADER_LEN..]);
    }
    let checksum = checksum32(&bytes[4..]);
    bytes[..4].copy_from_slice(&checksum.to_le_bytes());
    Ok(out.into_vec())
}

/// Verify and unwrap a datagram.
pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
    if datagram.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(datagram.len()));
    }
    if datagram.len() > MAX_PACKET_SIZE {
        return Err(DecodeError::TooLong(datagram.len()));
    }
    let header = PacketHeader::read_from_prefix(datagram).ok_or(DecodeError::TooShort(datagram.len()))?;
    if checksum32(&datagram[4..]) != header.checksum.get() {
        return Err(DecodeError::ChecksumMismatch);
    }
    let method = Method::try_from(header.method_bits()).map_err(DecodeError::Wire)?;

    let mut body = datagram[HEADER_LEN..].to_vec();
    if method.is_direct() {
        obfuscate(header.word.get(), &mut body);
    }
    Ok(Packet { method, body })
}

/// XOR with the repeating little-endian header word. Its own inverse.
fn obfuscate(word: u32, body: &mut [u8]) {
    let key = word.to_le_bytes();
    for (i, b) in body.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

// ── Session envelope ──────────────────────────────────────────────────────────

/// `session_id(u64) || seal(key, layer2)`, the body of ClientData/ServiceData.
pub fn seal_session(session_id: u64, key: &SecretKey, layer2: &[u8]) -> Vec<u8> {
    let sealed = seal(key, layer2);
    let mut w = ByteWriter::with_capacity(8 + sealed.len());
    w.put_u64(session_id);
    w.put_slice(&sealed);
    w.into_vec()
}

/// Split a session envelope into its plaintext session id and sealed part.
pub fn session_id_of(body: &[u8]) -> Result<(u64, &[u8]), WireError> {
    let mut r = ByteReader::new(body);
    let id = r.u64()?;
    Ok((id, r.rest()))
}

/// Open the sealed part of a session envelope.
pub fn open_session(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    open(key, sealed)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram of {0} bytes is shorter than the header")]
    TooShort(usize),

    #[error("datagram of {0} bytes exceeds the maximum packet size")]
    TooLong(usize),

    #[error("outer checksum mismatch")]
    ChecksumMismatch,

    #[error(transparent)]
    Wire(WireError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
