//! Switch control traffic, carried with message id 0.
//!
//! ```text
//! [kind u8][count varint][addr]...
//! ```
//!
//! kind 1 asks the peer for its addresses and offers ours, kind 2 answers.

use std::net::SocketAddr;

use hns_core::cursor::{ByteReader, ByteWriter};
use hns_core::wire::WireError;

/// More than any host plausibly has; bounds what a peer can make us store.
pub const MAX_EXCHANGED_ADDRESSES: usize = 16;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressExchange {
    Request(Vec<SocketAddr>),
    Response(Vec<SocketAddr>),
}

impl AddressExchange {
    pub fn addresses(&self) -> &[SocketAddr] {
        match self {
            AddressExchange::Request(a) | AddressExchange::Response(a) => a,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, addrs) = match self {
            AddressExchange::Request(a) => (KIND_REQUEST, a),
            AddressExchange::Response(a) => (KIND_RESPONSE, a),
        };
        let addrs = &addrs[..addrs.len().min(MAX_EXCHANGED_ADDRESSES)];
        let mut w = ByteWriter::new();
        w.put_u8(kind);
        w.put_varint(addrs.len() as u64);
        for addr in addrs {
            w.put_addr(Some(*addr));
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let kind = r.u8()?;
        let count = r.varint()?;
        if count > MAX_EXCHANGED_ADDRESSES as u64 {
            return Err(WireError::PayloadTooLarge(count as usize));
        }
        let mut addrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if let Some(addr) = r.addr()? {
                addrs.push(addr);
            }
        }
        if !r.is_empty() {
            return Err(WireError::TrailingBytes(r.remaining()));
        }
        match kind {
            KIND_REQUEST => Ok(AddressExchange::Request(addrs)),
            KIND_RESPONSE => Ok(AddressExchange::Response(addrs)),
            other => Err(WireError::UnknownSubMethod(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_decode() {
        let addrs: Vec<SocketAddr> = vec![
            "10.0.0.5:4000".parse().unwrap(),
            "[2001:db8::1]:4000".parse().unwrap(),
        ];
        let req = AddressExchange::Request(addrs.clone());
        assert_eq!(AddressExchange::decode(&req.encode()).unwrap(), req);
        let resp = AddressExchange::Response(Vec::new());
        assert_eq!(AddressExchange::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(
            AddressExchange::decode(&[7, 0]),
            Err(WireError::UnknownSubMethod(7))
        );
    }

    #[test]
    fn oversized_count_is_rejected() {
        assert!(AddressExchange::decode(&[1, 200, 1]).is_err());
    }

    #[test]
    fn encode_caps_address_count() {
        let many = vec!["10.0.0.1:1".parse().unwrap(); MAX_EXCHANGED_ADDRESSES + 4];
        let decoded = AddressExchange::decode(&AddressExchange::Request(many).encode()).unwrap();
        assert_eq!(decoded.addresses().len(), MAX_EXCHANGED_ADDRESSES);
    }
}
