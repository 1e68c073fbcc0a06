//! Core value types shared by the courier reactor and daemon: network
//! endpoints, bus messages and their wire encodings.

pub mod endpoint;
pub mod message;
mod wire;

pub use endpoint::{Endpoint, NetworkKind};
pub use message::{Message, MessageError, Timespec, MESSAGE_VERSION};
