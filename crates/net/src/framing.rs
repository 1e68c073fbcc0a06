//! Line- and message-framed connections over buffered streams.
use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use courier_types::message::Format;
use courier_types::Message;

use crate::connection::{Connection, Control, Meta};
use crate::error::Error;
use crate::stream::{drain_messages, MessageSink, StreamBuffer, StreamIo};
use crate::time::LocalTime;

/// Receives the messages parsed off a connection, plus its lifecycle.
///
/// Handlers run on the reactor thread and must not block; a handler that
/// needs to wait for a reply stores a correlation id and state on its own
/// side instead of suspending.
pub trait MessageHandler {
    /// A complete message arrived. Replies go through `sink`.
    fn process_message(&mut self, sink: &mut dyn MessageSink, msg: &Message, ctl: &mut Control);

    /// The underlying transport finished connecting.
    fn connected(&mut self, _sink: &mut dyn MessageSink, _ctl: &mut Control) {}

    /// The underlying transport went away.
    fn disconnected(&mut self, _ctl: &mut Control) {}

    /// A connection attempt failed before being established.
    fn connect_failed(&mut self, _ctl: &mut Control) {}

    /// The output buffer fully drained after a partial write.
    fn buffer_drained(&mut self, _ctl: &mut Control) {}
}

/// A connection that can transmit messages; what the daemon's routing
/// tables hold on to.
pub trait MessageConnection: Connection {
    fn send_message(&mut self, msg: &Message) -> Result<(), Error>;
}

/// Message-framed connection: parses each received line into a
/// [`Message`] and hands it to its [`MessageHandler`]; unparsable lines
/// are logged and discarded.
pub struct MessageStream<R: StreamIo> {
    meta: Meta,
    buffer: StreamBuffer<R>,
    handler: Box<dyn MessageHandler>,
}

impl<R: StreamIo> MessageStream<R> {
    pub fn new(name: impl Into<String>, raw: R, handler: Box<dyn MessageHandler>) -> Self {
        Self {
            meta: Meta::new(name),
            buffer: StreamBuffer::new(raw),
            handler,
        }
    }

    pub fn set_format(&mut self, format: Format) {
        self.buffer.set_format(format);
    }

    pub fn set_output_cap(&mut self, cap: Option<usize>) {
        self.buffer.set_output_cap(cap);
    }

    pub fn raw(&self) -> &R {
        self.buffer.raw()
    }

    fn teardown(&mut self, ctl: &mut Control) {
        // The handler learns about it in `connection_removed`.
        ctl.remove_self();
    }
}

impl<R: StreamIo> Connection for MessageStream<R> {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.buffer.raw_fd())
    }

    fn want_read(&self) -> bool {
        self.buffer.raw().wants_read()
    }

    fn want_write(&self) -> bool {
        self.buffer.has_output() || self.buffer.raw().wants_write()
    }

    fn has_pending_work(&self) -> bool {
        self.buffer.has_line()
    }

    fn has_output(&self) -> bool {
        self.buffer.has_output()
    }

    fn process_read(&mut self, ctl: &mut Control) {
        match self.buffer.fill() {
            Ok(0) => {
                // Orderly shutdown by the peer.
                trace!(target: "net", "{}: Peer closed the connection", self.meta.name());
                self.teardown(ctl);
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(target: "net", "{}: Read error: {}", self.meta.name(), err);
                self.teardown(ctl);
                return;
            }
        }

        let deadline = LocalTime::now() + self.meta.processing_budget();
        let limit = self.meta.event_limit();
        let Self {
            meta,
            buffer,
            handler,
        } = self;

        drain_messages(buffer, meta.name(), limit, deadline, |buffer, msg| {
            handler.process_message(buffer, &msg, ctl);
        });

        if self.buffer.is_overflowed() {
            debug!(target: "net", "{}: Output buffer over cap, closing", self.meta.name());
            self.meta.mark_done();
        }
    }

    fn process_write(&mut self, ctl: &mut Control) {
        match self.buffer.flush() {
            Ok(true) => self.handler.buffer_drained(ctl),
            Ok(false) => {}
            Err(err) => {
                debug!(target: "net", "{}: Write error: {}", self.meta.name(), err);
                self.teardown(ctl);
            }
        }
    }

    fn process_hup(&mut self, ctl: &mut Control) {
        self.teardown(ctl);
    }

    fn process_error(&mut self, ctl: &mut Control) {
        self.teardown(ctl);
    }

    fn connection_removed(&mut self, ctl: &mut Control) {
        self.handler.disconnected(ctl);
    }
}

impl<R: StreamIo> MessageConnection for MessageStream<R> {
    fn send_message(&mut self, msg: &Message) -> Result<(), Error> {
        self.buffer.send_message(msg)?;

        // Opportunistic flush; leftovers drain on writability.
        self.buffer.flush().ok();
        Ok(())
    }
}

/// Line-framed connection: hands complete lines to a closure. Used where
/// the payload is not a bus message (child process output, test drivers).
pub struct LineStream<R: StreamIo> {
    meta: Meta,
    buffer: StreamBuffer<R>,
    on_line: Box<dyn FnMut(&str, &mut Control)>,
}

impl<R: StreamIo> LineStream<R> {
    pub fn new(
        name: impl Into<String>,
        raw: R,
        on_line: Box<dyn FnMut(&str, &mut Control)>,
    ) -> Self {
        Self {
            meta: Meta::new(name),
            buffer: StreamBuffer::new(raw),
            on_line,
        }
    }

    /// Queue a line for transmission.
    pub fn write_line(&mut self, line: &str) {
        self.buffer.write_line(line);
    }
}

impl<R: StreamIo> Connection for LineStream<R> {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.buffer.raw_fd())
    }

    fn want_write(&self) -> bool {
        self.buffer.has_output()
    }

    fn has_pending_work(&self) -> bool {
        self.buffer.has_line()
    }

    fn has_output(&self) -> bool {
        self.buffer.has_output()
    }

    fn process_read(&mut self, ctl: &mut Control) {
        match self.buffer.fill() {
            Ok(0) => {
                ctl.remove_self();
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!(target: "net", "{}: Read error: {}", self.meta.name(), err);
                ctl.remove_self();
                return;
            }
        }

        for _ in 0..self.meta.event_limit() {
            match self.buffer.next_line() {
                Some(Ok(line)) => (self.on_line)(&line, ctl),
                Some(Err(_)) => {
                    debug!(target: "net", "{}: Discarding non-utf8 line", self.meta.name());
                }
                None => break,
            }
        }
    }

    fn process_write(&mut self, ctl: &mut Control) {
        if self.buffer.flush().is_err() {
            ctl.remove_self();
        }
    }
}
