//! Reactor-based event dispatching and message transports.
//!
//! The [`Reactor`] multiplexes a heterogeneous set of [`Connection`]s over
//! a single-threaded `poll` loop: listeners, stream clients, datagram
//! endpoints, pipes, timers, signal handlers, file watchers and
//! cross-thread channels. Stream transports frame bytes into lines and
//! messages; the [`Dispatcher`] routes messages to handlers.

pub mod channel;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod permanent;
pub mod pipe;
pub mod reactor;
pub mod signals;
pub mod stream;
mod sys;
pub mod tcp;
pub mod time;
pub mod timer;
pub mod tls;
pub mod udp;
pub mod unix;
pub mod watch;

pub use connection::{Connection, ConnectionId, ConnectionRef, Control, Meta};
pub use dispatch::{BuiltinCommands, Dispatcher, Match, MessageContext};
pub use error::Error;
pub use framing::{LineStream, MessageConnection, MessageHandler, MessageStream};
pub use permanent::{PermanentClient, SendOptions, SendPriority};
pub use reactor::{Reactor, Waker};
pub use stream::{MessageSink, StreamBuffer, StreamIo};
pub use time::{LocalDuration, LocalTime, TimeoutManager};
pub use timer::Timer;
