//! Transport layer: wire framing and the pub/sub and control-channel
//! protocols built on top of it.
//!
//! Every module here speaks over a length-prefixed `bincode` frame on
//! plain TCP (see `DESIGN.md`'s "Transport substitution" entry) rather
//! than a message-queue socket library, so every module that would have
//! spoken PUB/SUB or REQ/ROUTER instead wraps a
//! [`tokio::net::TcpStream`]/[`tokio::net::TcpListener`] pair.

pub mod cache;
pub mod control_client;
pub mod control_router;
pub mod control_server;
pub mod pubsub;
pub mod wire;
