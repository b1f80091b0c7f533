//! hns-switch: the peer side of HNS.
//!
//! `RelayClient` keeps a session with one relay. `SwitchCore` owns a set of
//! relay clients and the host table, runs the direct ping handshake and hole
//! punching, and picks delivery paths. `Switch` binds the socket and drives
//! the core from tokio tasks.

pub mod control;
pub mod error;
pub mod events;
pub mod host;
pub mod punch;
pub mod relay_client;
pub mod runtime;
pub mod switch;

pub use error::SendError;
pub use events::{DeliveryPath, SwitchEvent};
pub use host::{HostFlags, HostStatus};
pub use relay_client::{RelayClient, RelayClientSettings, RelayClientStatus, RelayEvent, RelayState};
pub use runtime::Switch;
pub use switch::{DeliveryMode, DeliveryReport, SwitchCore};
