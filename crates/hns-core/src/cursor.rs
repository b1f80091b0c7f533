//! Bounds-checked byte cursors for building and parsing datagram bodies.
//!
//! `ByteWriter` grows as needed. `ByteReader` never reads past the end of
//! its slice: every read returns `Err(WireError::Truncated)` instead of
//! panicking or silently truncating. All integers are little-endian.
//!
//! Lengths and counts use LEB128 varints (7 data bits per byte, high bit set
//! on every byte except the last).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::wire::{WireError, MAX_ID_LEN};

/// Longest varint we accept: enough for any u64.
const MAX_VARINT_LEN: usize = 10;

// ── Writer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn put_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.put_u8((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
    }

    /// Varint length prefix followed by the raw bytes.
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_varint(data.len() as u64);
        self.buf.put_slice(data);
    }

    /// Host and client identifiers. Rejects ids longer than `MAX_ID_LEN`.
    pub fn put_id(&mut self, id: &str) -> Result<(), WireError> {
        if id.len() > MAX_ID_LEN {
            return Err(WireError::IdTooLong(id.len()));
        }
        self.put_bytes(id.as_bytes());
        Ok(())
    }

    /// Family byte (0 = none, 4 = IPv4, 6 = IPv6), address octets, port.
    pub fn put_addr(&mut self, addr: Option<SocketAddr>) {
        match addr {
            None => self.put_u8(0),
            Some(SocketAddr::V4(v4)) => {
                self.put_u8(4);
                self.put_slice(&v4.ip().octets());
                self.put_u16(v4.port());
            }
            Some(SocketAddr::V6(v6)) => {
                self.put_u8(6);
                self.put_slice(&v6.ip().octets());
                self.put_u16(v6.port());
            }
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view, used to patch headers after the body is written.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn varint(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.u8()?;
            let bits = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(WireError::VarintOverflow);
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| WireError::VarintOverflow)?;
        self.take(len)
    }

    pub fn id(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        if raw.len() > MAX_ID_LEN {
            return Err(WireError::IdTooLong(raw.len()));
        }
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    pub fn addr(&mut self) -> Result<Option<SocketAddr>, WireError> {
        match self.u8()? {
            0 => Ok(None),
            4 => {
                let ip = Ipv4Addr::from(self.array::<4>()?);
                let port = self.u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            6 => {
                let ip = Ipv6Addr::from(self.array::<16>()?);
                let port = self.u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            other => Err(WireError::UnknownAddressFamily(other)),
        }
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}
