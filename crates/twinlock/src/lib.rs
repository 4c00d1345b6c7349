//! Twinlock: mutual exclusion across processes, served by a primary/standby
//! server pair.
//!
//! Clients hold a link to both servers and send lock traffic to one of them.
//! The server that grants a lock mirrors the grant to its peer, so the peer can
//! take over with the same table when the active server goes away.

pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod resolver;
pub mod server;

pub use client::{HandleState, LinkEvent, LinkManager, LockClient, LockHandle, OwnerId, Slot};
pub use config::{ClientConfig, ServerArgs, ServerConfig};
pub use error::LockError;
pub use net::LinkState;
pub use resolver::{Endpoints, Resolver, StaticResolver};
pub use server::{start_server, ServerHandle};
pub use twinlock_proto::LockInfo;
