//! The courier message bus daemon.
//!
//! Local services register over loopback TCP or Unix sockets; peer
//! daemons interconnect over the remote listener. Messages are routed by
//! service name across the whole cluster, cached for services that have
//! not registered yet, and broadcast with de-duplication. The daemon
//! tracks cluster quorum and gossips its own address to peers that are
//! expected to dial us.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod loadavg;
pub mod neighbors;
pub mod peers;
pub mod registry;
pub mod router;
pub mod server;

pub use config::Config;
pub use error::DaemonError;
pub use server::{Server, Shutdown};

#[cfg(test)]
mod tests;
