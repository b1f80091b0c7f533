//! hns-core: wire format, codec, crypto, and configuration for HNS.
//! The relay service, the switch, and the daemon all depend on this crate.

pub mod config;
pub mod crypto;
pub mod cursor;
pub mod ids;
pub mod message;
pub mod net;
pub mod packet;
pub mod wire;

pub use crypto::SecretKey;
pub use net::DatagramSink;
pub use packet::{DecodeError, Packet};
pub use wire::{Method, WireError};
