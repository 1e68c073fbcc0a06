//! Self-reconnecting message client with an outgoing message cache.
use std::collections::VecDeque;
use std::net::{self, SocketAddr};
use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use courier_types::message::Format;
use courier_types::Message;

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;
use crate::framing::{MessageConnection, MessageHandler};
use crate::stream::{drain_messages, MessageSink, StreamBuffer};
use crate::tcp;
use crate::time::{LocalDuration, LocalTime};

/// Default pause before a reconnection attempt.
pub const RECONNECT_PAUSE_DEFAULT: LocalDuration = LocalDuration::from_secs(5);
/// Default cap on the reconnection back-off.
pub const RECONNECT_PAUSE_MAX: LocalDuration = LocalDuration::from_mins(5);
/// Time to wait for a non-blocking connect to complete.
const CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);

/// Priority of a cached message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPriority {
    #[default]
    Normal,
    Low,
}

/// Per-message send options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Keep the message while disconnected.
    pub cache: bool,
    /// How long a cached message stays deliverable.
    pub timeout: Option<LocalDuration>,
    pub priority: SendPriority,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            cache: true,
            timeout: None,
            priority: SendPriority::Normal,
        }
    }
}

struct Cached {
    msg: Message,
    deadline: Option<LocalTime>,
    priority: SendPriority,
}

enum State {
    /// Waiting out the reconnection pause.
    Waiting { until: LocalTime },
    /// Non-blocking connect in flight; connected once writable.
    Connecting,
    Connected,
    /// Disconnected with reconnection disabled.
    Idle,
}

/// A message client that keeps itself connected.
///
/// On any disconnect or failure a reconnect is scheduled after a pause,
/// growing exponentially up to a cap. Messages submitted while
/// disconnected are cached (subject to their options) and flushed in FIFO
/// order, normal priority first, once the link is up again.
pub struct PermanentClient {
    meta: Meta,
    addr: SocketAddr,
    stream: Option<StreamBuffer<net::TcpStream>>,
    state: State,
    pause: Option<LocalDuration>,
    max_pause: LocalDuration,
    current_pause: LocalDuration,
    cache: VecDeque<Cached>,
    format: Format,
    handler: Box<dyn MessageHandler>,
}

impl PermanentClient {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Box<dyn MessageHandler>,
    ) -> Self {
        Self {
            meta: Meta::new(name),
            addr,
            stream: None,
            state: State::Waiting {
                until: LocalTime::default(),
            },
            pause: Some(RECONNECT_PAUSE_DEFAULT),
            max_pause: RECONNECT_PAUSE_MAX,
            current_pause: RECONNECT_PAUSE_DEFAULT,
            cache: VecDeque::new(),
            format: Format::Text,
            handler,
        }
    }

    /// Set the reconnection pause; `None` disables reconnection.
    pub fn with_pause(mut self, pause: Option<LocalDuration>) -> Self {
        self.pause = pause;
        self.current_pause = pause.unwrap_or(RECONNECT_PAUSE_DEFAULT);
        self
    }

    /// Cap the reconnection back-off.
    pub fn with_max_pause(mut self, max: LocalDuration) -> Self {
        self.max_pause = max;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected)
    }

    /// Number of messages currently cached.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Submit a message: transmitted right away when connected, cached
    /// (subject to `opts`) otherwise.
    pub fn send(&mut self, msg: &Message, opts: SendOptions) -> Result<(), Error> {
        if let (State::Connected, Some(buffer)) = (&self.state, &mut self.stream) {
            buffer.send_message(msg)?;
            buffer.flush().ok();
            return Ok(());
        }

        if opts.cache {
            self.cache.push_back(Cached {
                msg: msg.clone(),
                deadline: opts.timeout.map(|t| LocalTime::now() + t),
                priority: opts.priority,
            });
        } else {
            debug!(
                target: "net",
                "{}: Dropping {} while disconnected",
                self.meta.name(),
                msg.command(),
            );
        }
        Ok(())
    }

    fn start_connect(&mut self, ctl: &mut Control) {
        let now = ctl.now();

        match tcp::dial(&self.addr) {
            Ok(stream) => {
                trace!(target: "net", "{}: Connecting to {}", self.meta.name(), self.addr);

                let mut buffer = StreamBuffer::new(stream);

                buffer.set_format(self.format);
                self.stream = Some(buffer);
                self.state = State::Connecting;
                self.meta.set_timeout_date(Some(now + CONNECT_TIMEOUT));
            }
            Err(err) => {
                debug!(target: "net", "{}: Dial error: {}", self.meta.name(), err);
                self.handler.connect_failed(ctl);
                self.schedule_retry(now);
            }
        }
    }

    fn schedule_retry(&mut self, now: LocalTime) {
        self.stream = None;

        let Some(_) = self.pause else {
            // Reconnection disabled; nothing left for this connection.
            self.state = State::Idle;
            self.meta.set_timeout_date(None);
            self.meta.mark_done();
            return;
        };

        let delay = self.current_pause;

        self.current_pause = (delay * 2).min(self.max_pause);
        self.state = State::Waiting { until: now + delay };
        self.meta.set_timeout_date(Some(now + delay));

        trace!(
            target: "net",
            "{}: Reconnecting to {} in {}",
            self.meta.name(),
            self.addr,
            delay,
        );
    }

    fn failed(&mut self, ctl: &mut Control) {
        if matches!(self.state, State::Connected) {
            self.handler.disconnected(ctl);
        } else {
            self.handler.connect_failed(ctl);
        }
        self.schedule_retry(LocalTime::now());
    }

    fn established(&mut self, ctl: &mut Control) {
        let now = LocalTime::now();

        trace!(target: "net", "{}: Connected to {}", self.meta.name(), self.addr);

        self.state = State::Connected;
        self.meta.set_timeout_date(None);
        self.current_pause = self.pause.unwrap_or(RECONNECT_PAUSE_DEFAULT);

        let Some(buffer) = &mut self.stream else {
            return;
        };
        self.handler.connected(buffer, ctl);

        // Flush the cache in FIFO order, normal priority first, dropping
        // entries whose deadline passed.
        let cached = std::mem::take(&mut self.cache);
        let (normal, low): (VecDeque<_>, VecDeque<_>) = cached
            .into_iter()
            .filter(|c| c.deadline.map_or(true, |deadline| deadline > now))
            .partition(|c| c.priority == SendPriority::Normal);

        for cached in normal.into_iter().chain(low) {
            if let Err(err) = buffer.send_message(&cached.msg) {
                debug!(target: "net", "{}: Cannot replay {}: {}", self.meta.name(), cached.msg.command(), err);
            }
        }
        buffer.flush().ok();
    }
}

impl Connection for PermanentClient {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|buffer| buffer.raw_fd())
    }

    fn want_read(&self) -> bool {
        self.stream.is_some()
    }

    fn want_write(&self) -> bool {
        match &self.state {
            State::Connecting => true,
            State::Connected => self
                .stream
                .as_ref()
                .map(|buffer| buffer.has_output())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn has_pending_work(&self) -> bool {
        self.stream
            .as_ref()
            .map(|buffer| buffer.has_line())
            .unwrap_or(false)
    }

    fn has_output(&self) -> bool {
        self.stream
            .as_ref()
            .map(|buffer| buffer.has_output())
            .unwrap_or(false)
    }

    fn connection_added(&mut self, ctl: &mut Control) {
        self.start_connect(ctl);
    }

    fn process_read(&mut self, ctl: &mut Control) {
        let Some(buffer) = &mut self.stream else {
            return;
        };

        match buffer.fill() {
            Ok(0) => {
                trace!(target: "net", "{}: Peer closed the connection", self.meta.name());
                self.failed(ctl);
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(target: "net", "{}: Read error: {}", self.meta.name(), err);
                self.failed(ctl);
                return;
            }
        }

        let deadline = LocalTime::now() + self.meta.processing_budget();
        let limit = self.meta.event_limit();
        let Self {
            meta,
            stream,
            handler,
            ..
        } = self;
        let Some(buffer) = stream else { return };

        drain_messages(buffer, meta.name(), limit, deadline, |buffer, msg| {
            handler.process_message(buffer, &msg, ctl);
        });
    }

    fn process_write(&mut self, ctl: &mut Control) {
        if matches!(self.state, State::Connecting) {
            // A non-blocking connect reports writability once established.
            if let Some(Ok(Some(err))) = self
                .stream
                .as_ref()
                .map(|buffer| buffer.raw().take_error())
            {
                debug!(target: "net", "{}: Connect error: {}", self.meta.name(), err);
                self.failed(ctl);
                return;
            }
            self.established(ctl);
            return;
        }

        let Some(buffer) = &mut self.stream else {
            return;
        };
        if buffer.flush().is_err() {
            self.failed(ctl);
        }
    }

    fn process_timeout(&mut self, ctl: &mut Control) {
        match self.state {
            State::Waiting { until } if ctl.now() >= until => self.start_connect(ctl),
            State::Waiting { .. } => {}
            State::Connecting => {
                debug!(target: "net", "{}: Connect to {} timed out", self.meta.name(), self.addr);
                self.failed(ctl);
            }
            _ => {}
        }
    }

    fn process_error(&mut self, ctl: &mut Control) {
        self.failed(ctl);
    }

    fn process_hup(&mut self, ctl: &mut Control) {
        self.failed(ctl);
    }

    fn connection_removed(&mut self, ctl: &mut Control) {
        if matches!(self.state, State::Connected) {
            self.handler.disconnected(ctl);
        }
    }
}

impl MessageConnection for PermanentClient {
    fn send_message(&mut self, msg: &Message) -> Result<(), Error> {
        self.send(msg, SendOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{BufRead, BufReader};
    use std::rc::Rc;

    use crate::reactor::Reactor;
    use crate::stream::VecSink;

    struct Quiet;

    impl MessageHandler for Quiet {
        fn process_message(&mut self, _sink: &mut dyn MessageSink, _msg: &Message, _ctl: &mut Control) {}
    }

    #[test]
    fn test_cache_replayed_on_first_connect() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = PermanentClient::new("client", addr, Box::new(Quiet))
            .with_pause(Some(LocalDuration::from_secs(0)));

        // Queued while disconnected; the expired one must not be
        // replayed, and low priority sorts after normal.
        client
            .send(&Message::new("LATE"), SendOptions {
                priority: SendPriority::Low,
                ..SendOptions::default()
            })
            .unwrap();
        client.send(&Message::new("FIRST"), SendOptions::default()).unwrap();
        client
            .send(&Message::new("GONE"), SendOptions {
                timeout: Some(LocalDuration::from_micros(0)),
                ..SendOptions::default()
            })
            .unwrap();
        client.send(&Message::new("SECOND"), SendOptions::default()).unwrap();
        assert_eq!(client.cached(), 4);

        let mut reactor = Reactor::new().unwrap();
        let client = Rc::new(RefCell::new(client));
        reactor.add(client.clone()).unwrap();

        // Dial happens on attach; accept and let the reactor finish the
        // handshake and replay the cache.
        reactor.poll(LocalDuration::from_millis(50)).unwrap();
        let (peer, _) = listener.accept().unwrap();

        for _ in 0..10 {
            reactor.poll(LocalDuration::from_millis(50)).unwrap();
            if client.borrow().is_connected() && !client.borrow().has_output() {
                break;
            }
        }
        assert!(client.borrow().is_connected());
        assert_eq!(client.borrow().cached(), 0);

        peer.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut lines = BufReader::new(peer).lines();

        assert_eq!(lines.next().unwrap().unwrap(), "FIRST");
        assert_eq!(lines.next().unwrap().unwrap(), "SECOND");
        assert_eq!(lines.next().unwrap().unwrap(), "LATE");
    }

    #[test]
    fn test_uncached_send_dropped_while_disconnected() {
        let mut client = PermanentClient::new(
            "client",
            "127.0.0.1:1".parse().unwrap(),
            Box::new(Quiet),
        );

        client
            .send(&Message::new("EPHEMERAL"), SendOptions {
                cache: false,
                ..SendOptions::default()
            })
            .unwrap();
        assert_eq!(client.cached(), 0);
    }

    #[test]
    fn test_sink_capture() {
        // VecSink keeps the dispatcher-facing contract honest.
        let mut sink = VecSink::default();
        sink.send_message(&Message::new("X")).unwrap();
        assert_eq!(sink.messages[0].command(), "X");
    }
}
