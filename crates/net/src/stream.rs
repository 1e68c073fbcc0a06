//! Buffered line-oriented stream plumbing shared by every stream
//! transport.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::warn;

use courier_types::message::Format;
use courier_types::Message;

use crate::error::Error;

/// Something messages can be written to: a buffered stream, a datagram
/// socket, a test capture.
pub trait MessageSink {
    /// Queue (or send) one message.
    fn send_message(&mut self, msg: &Message) -> Result<(), Error>;
}

/// Raw byte stream driven by the reactor.
///
/// `TcpStream`, Unix streams and pipe pairs implement this directly; a TLS
/// provider reports its handshake interest through the `wants_*` hooks.
pub trait StreamIo: Read + Write + AsRawFd {
    /// Transport-level read interest beyond buffered application data.
    fn wants_read(&self) -> bool {
        true
    }

    /// Transport-level write interest beyond buffered application data.
    fn wants_write(&self) -> bool {
        false
    }
}

impl StreamIo for std::net::TcpStream {}
impl StreamIo for std::os::unix::net::UnixStream {}

/// Buffered input/output over a raw stream.
///
/// Input accumulates until complete `\n`-terminated lines can be handed
/// out; partial lines survive across reads. Output is appended by
/// [`StreamBuffer::write_line`] and drained by [`StreamBuffer::flush`]
/// when the reactor reports writability; short writes are retried on the
/// next iteration.
pub struct StreamBuffer<R> {
    raw: R,
    input: Vec<u8>,
    output: VecDeque<u8>,
    format: Format,
    /// Soft cap on buffered output; `None` means unbounded.
    output_cap: Option<usize>,
    overflowed: bool,
}

impl<R: StreamIo> StreamBuffer<R> {
    pub fn new(raw: R) -> Self {
        Self {
            raw,
            input: Vec::new(),
            output: VecDeque::new(),
            format: Format::Text,
            output_cap: None,
            overflowed: false,
        }
    }

    /// Select the wire encoding used by [`MessageSink::send_message`].
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Configure the soft output cap; exceeding it marks the buffer
    /// overflowed so the owner can close the connection.
    pub fn set_output_cap(&mut self, cap: Option<usize>) {
        self.output_cap = cap;
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut R {
        &mut self.raw
    }

    pub fn raw_fd(&self) -> RawFd {
        self.raw.as_raw_fd()
    }

    /// Read once from the stream into the input buffer. `Ok(0)` means the
    /// peer performed an orderly shutdown.
    ///
    /// Nb. `poll` is level-triggered: if data remains on the socket we
    /// will be notified again, so a single read per readiness suffices.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 8192];
        let count = self.raw.read(&mut buf)?;

        self.input.extend_from_slice(&buf[..count]);
        Ok(count)
    }

    /// Whether a complete line is buffered.
    pub fn has_line(&self) -> bool {
        self.input.contains(&b'\n')
    }

    /// Take the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let position = self.input.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.input.drain(..=position).collect();

        line.pop(); // '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8(line))
    }

    /// Append raw bytes to the output buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);

        if let Some(cap) = self.output_cap {
            if self.output.len() > cap {
                self.overflowed = true;
            }
        }
    }

    /// Append one line plus terminator to the output buffer.
    pub fn write_line(&mut self, line: &str) {
        self.write_bytes(line.as_bytes());
        self.output.push_back(b'\n');
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Whether the soft output cap was exceeded.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Attempt to drain the output buffer. Returns `Ok(true)` once
    /// everything was written.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.output.is_empty() {
            let (head, _) = self.output.as_slices();

            match self.raw.write(head) {
                Ok(0) => return Ok(false),
                Ok(count) => {
                    self.output.drain(..count);
                }
                Err(err)
                    if [io::ErrorKind::WouldBlock, io::ErrorKind::Interrupted]
                        .contains(&err.kind()) =>
                {
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

impl<R: StreamIo> MessageSink for StreamBuffer<R> {
    fn send_message(&mut self, msg: &Message) -> Result<(), Error> {
        let line = msg.serialize(self.format)?;

        self.write_line(&line);
        Ok(())
    }
}

/// Decode buffered input into messages, bounded by an event budget.
///
/// Invalid lines are logged and discarded; at most `limit` messages are
/// produced so one connection cannot monopolize a reactor step.
pub(crate) fn drain_messages<R: StreamIo>(
    buffer: &mut StreamBuffer<R>,
    name: &str,
    limit: usize,
    deadline: crate::time::LocalTime,
    mut handle: impl FnMut(&mut StreamBuffer<R>, Message),
) {
    for _ in 0..limit {
        if crate::time::LocalTime::now() >= deadline {
            break;
        }
        let Some(line) = buffer.next_line() else {
            break;
        };
        let line = match line {
            Ok(line) => line,
            Err(_) => {
                warn!(target: "net", "{}: Discarding non-utf8 line", name);
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match Message::parse(&line) {
            Ok(msg) => handle(buffer, msg),
            Err(err) => {
                warn!(target: "net", "{}: Discarding invalid message: {}", name, err);
            }
        }
    }
}

/// Capturing sink for tests and for routing decisions made away from a
/// live connection.
#[derive(Default)]
pub struct VecSink {
    pub messages: Vec<Message>,
}

impl MessageSink for VecSink {
    fn send_message(&mut self, msg: &Message) -> Result<(), Error> {
        self.messages.push(msg.clone());
        Ok(())
    }
}
