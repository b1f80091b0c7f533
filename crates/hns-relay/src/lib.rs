//! hns-relay: the HNS relay service.
//!
//! Authenticates clients, keeps the session directory, and relays queries
//! and messages between registered clients.

pub mod directory;
pub mod handler;
pub mod policy;
pub mod server;

pub use directory::{ClientSession, SessionDirectory};
pub use handler::{PendingInit, RelayHandler};
pub use policy::{Authorizer, ClientPolicy, TrustLevel};
pub use server::{RelayService, RelayServiceStatus};
