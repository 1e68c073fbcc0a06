//! Command dispatching: an ordered match table routing messages to
//! handlers.
use tracing::{debug, warn};

use courier_types::{Message, Timespec};

use crate::connection::Control;
use crate::error::Error;
use crate::stream::MessageSink;
use crate::time::LocalTime;

/// Default priority of a match entry; lower runs earlier.
pub const MATCH_PRIORITY_DEFAULT: u8 = 5;

/// Everything a handler needs while processing one message.
pub struct MessageContext<'a> {
    /// The message being dispatched.
    pub msg: &'a Message,
    /// Where replies to the sender go.
    pub sink: &'a mut dyn MessageSink,
    /// Reactor control for structural changes.
    pub ctl: &'a mut Control,
}

impl MessageContext<'_> {
    /// Send a reply, logging a failure instead of propagating it; a bad
    /// sink must not unwind through the dispatcher.
    pub fn reply(&mut self, msg: &Message) {
        if let Err(err) = self.sink.send_message(msg) {
            warn!(target: "dispatch", "Cannot send {}: {}", msg.command(), err);
        }
    }
}

/// Handler invoked when a match claims a message.
pub type MatchCallback<T> = Box<dyn FnMut(&mut T, &mut MessageContext<'_>)>;

/// How a match decides whether it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Command equals the expression; claims the message.
    OneToOne,
    /// Command equals the expression, but dispatch continues so other
    /// handlers may observe the same command.
    Callback,
    /// Expression is a regular expression over the command.
    Regex,
    /// Matches everything; reserved for the catch-all slot.
    Always,
}

/// One entry of a dispatcher's match table.
pub struct Match<T> {
    expression: Option<String>,
    pattern: Option<regex::Regex>,
    kind: MatchKind,
    callback: MatchCallback<T>,
    priority: u8,
    tag: Option<String>,
}

impl<T> Match<T> {
    /// Match a command literally.
    pub fn command(expression: impl Into<String>, callback: MatchCallback<T>) -> Self {
        Self {
            expression: Some(expression.into()),
            pattern: None,
            kind: MatchKind::OneToOne,
            callback,
            priority: MATCH_PRIORITY_DEFAULT,
            tag: None,
        }
    }

    /// Match a command literally without claiming it.
    pub fn callback(expression: impl Into<String>, callback: MatchCallback<T>) -> Self {
        Self {
            kind: MatchKind::Callback,
            ..Self::command(expression, callback)
        }
    }

    /// Match commands against a regular expression.
    pub fn regex(pattern: &str, callback: MatchCallback<T>) -> Result<Self, Error> {
        Ok(Self {
            expression: None,
            pattern: Some(regex::Regex::new(pattern)?),
            kind: MatchKind::Regex,
            callback,
            priority: MATCH_PRIORITY_DEFAULT,
            tag: None,
        })
    }

    /// Match every message; only valid as the catch-all.
    pub fn always(callback: MatchCallback<T>) -> Self {
        Self {
            expression: None,
            pattern: None,
            kind: MatchKind::Always,
            callback,
            priority: u8::MAX,
            tag: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Tag the entry so it can be removed in bulk later.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn matches(&self, command: &str) -> bool {
        match self.kind {
            MatchKind::OneToOne | MatchKind::Callback => {
                self.expression.as_deref() == Some(command)
            }
            MatchKind::Regex => self
                .pattern
                .as_ref()
                .map(|p| p.is_match(command))
                .unwrap_or(false),
            MatchKind::Always => true,
        }
    }
}

/// Command → handler routing table.
///
/// Entries are kept priority-sorted (stable on insertion order); dispatch
/// walks them in order and stops at the first claiming match. Callback
/// matches observe the command without claiming it. The optional
/// catch-all runs when nothing claimed the message.
pub struct Dispatcher<T> {
    matches: Vec<Match<T>>,
    catch_all: Option<Match<T>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self {
            matches: Vec::new(),
            catch_all: None,
        }
    }

    /// Add one match, priority-sorted stable. A second always-match is an
    /// implementation error and is rejected.
    pub fn add(&mut self, m: Match<T>) -> Result<(), Error> {
        if m.kind == MatchKind::Always {
            if self.catch_all.is_some() {
                debug_assert!(false, "second always-match added to dispatcher");
                return Err(Error::Implementation(
                    "a dispatcher accepts a single always-match",
                ));
            }
            self.catch_all = Some(m);
            return Ok(());
        }

        let position = self
            .matches
            .iter()
            .position(|existing| existing.priority > m.priority)
            .unwrap_or(self.matches.len());

        self.matches.insert(position, m);
        Ok(())
    }

    pub fn add_many(&mut self, matches: Vec<Match<T>>) -> Result<(), Error> {
        for m in matches {
            self.add(m)?;
        }
        Ok(())
    }

    /// Drop every entry carrying the given tag.
    pub fn remove_by_tag(&mut self, tag: &str) {
        self.matches.retain(|m| m.tag.as_deref() != Some(tag));
    }

    /// The literal commands this dispatcher understands, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .matches
            .iter()
            .filter_map(|m| m.expression.clone())
            .collect();

        commands.sort();
        commands.dedup();
        commands
    }

    /// Route one message. Returns true iff any handler ran.
    pub fn dispatch(&mut self, target: &mut T, ctx: &mut MessageContext<'_>) -> bool {
        let command = ctx.msg.command();
        let mut observed = false;

        for m in &mut self.matches {
            if !m.matches(command) {
                continue;
            }
            (m.callback)(target, ctx);
            observed = true;

            if m.kind != MatchKind::Callback {
                // Claimed; at most one non-callback handler runs.
                return true;
            }
        }

        if let Some(catch_all) = &mut self.catch_all {
            (catch_all.callback)(target, ctx);
            return true;
        }
        observed
    }
}

/// Hooks behind the standard command set shared by every message
/// connection.
pub trait BuiltinCommands {
    /// `READY` was received; the daemon told us our public address.
    fn ready(&mut self, _ctx: &mut MessageContext) {}

    /// `STOP` (or `QUITTING`, with `quitting` true) was received.
    fn stop(&mut self, quitting: bool, ctx: &mut MessageContext);

    /// `RESTART` was received; defaults to a plain stop.
    fn restart(&mut self, ctx: &mut MessageContext) {
        self.stop(false, ctx);
    }

    /// `LOG_ROTATE` was received; reopen log outputs.
    fn log_rotate(&mut self, _ctx: &mut MessageContext) {}

    /// `LEAK` was received; dump diagnostics.
    fn leak(&mut self, _ctx: &mut MessageContext) {}

    /// `SERVICE_UNAVAILABLE` was received; default is to ignore it.
    fn service_unavailable(&mut self, _ctx: &mut MessageContext) {}
}

/// The current time as a message timestamp.
pub fn timespec_now() -> Timespec {
    let micros = LocalTime::now().as_micros();

    Timespec::new((micros / 1_000_000) as i64, ((micros % 1_000_000) * 1000) as u32)
}

impl<T: BuiltinCommands + 'static> Dispatcher<T> {
    /// Register the standard command set: `ALIVE`, `HELP`, `INVALID`,
    /// `LEAK`, `LOG_ROTATE`, `QUITTING`, `READY`, `RESTART`,
    /// `SERVICE_UNAVAILABLE`, `STOP`, `UNKNOWN`, plus a catch-all
    /// answering `UNKNOWN`.
    pub fn add_builtin_commands(&mut self) -> Result<(), Error> {
        const BUILTINS: &[&str] = &[
            "ALIVE",
            "HELP",
            "INVALID",
            "LEAK",
            "LOG_ROTATE",
            "QUITTING",
            "READY",
            "RESTART",
            "SERVICE_UNAVAILABLE",
            "STOP",
            "UNKNOWN",
        ];

        let mut commands = self.commands();
        commands.extend(BUILTINS.iter().map(|c| c.to_string()));
        commands.sort();
        commands.dedup();
        let command_list = commands.join(",");

        self.add_many(vec![
            Match::command("ALIVE", Box::new(|_t, ctx| msg_alive(ctx))),
            Match::command(
                "HELP",
                Box::new(move |_t, ctx| {
                    let mut reply = Message::reply_to(ctx.msg);

                    reply.set_command("COMMANDS");
                    reply.set_parameter("list", &command_list);
                    ctx.reply(&reply);
                }),
            ),
            Match::command("INVALID", Box::new(|_t, ctx| msg_log_unknown(ctx))),
            Match::command("UNKNOWN", Box::new(|_t, ctx| msg_log_unknown(ctx))),
            Match::command("LEAK", Box::new(|t: &mut T, ctx| t.leak(ctx))),
            Match::command("LOG_ROTATE", Box::new(|t: &mut T, ctx| t.log_rotate(ctx))),
            Match::command("QUITTING", Box::new(|t: &mut T, ctx| t.stop(true, ctx))),
            Match::command("READY", Box::new(|t: &mut T, ctx| t.ready(ctx))),
            Match::command("RESTART", Box::new(|t: &mut T, ctx| t.restart(ctx))),
            Match::command(
                "SERVICE_UNAVAILABLE",
                Box::new(|t: &mut T, ctx| t.service_unavailable(ctx)),
            ),
            Match::command("STOP", Box::new(|t: &mut T, ctx| t.stop(false, ctx))),
            Match::always(Box::new(|_t, ctx| msg_reply_with_unknown(ctx))),
        ])
    }
}

/// Reply `ABSOLUTELY`, echoing `serial` and `timestamp` and stamping
/// `reply_timestamp`.
fn msg_alive(ctx: &mut MessageContext) {
    let mut reply = Message::reply_to(ctx.msg);

    reply.set_command("ABSOLUTELY");
    for echoed in ["serial", "timestamp"] {
        if let Some(value) = ctx.msg.parameter(echoed) {
            reply.set_parameter(echoed, value);
        }
    }
    reply.set_parameter("reply_timestamp", timespec_now());
    ctx.reply(&reply);
}

fn msg_log_unknown(ctx: &mut MessageContext) {
    debug!(
        target: "dispatch",
        "Peer did not understand one of our messages: {}",
        ctx.msg,
    );
}

/// Catch-all: tell the sender we did not understand the command.
fn msg_reply_with_unknown(ctx: &mut MessageContext) {
    // Never answer UNKNOWN with UNKNOWN.
    if ctx.msg.command() == "UNKNOWN" {
        return;
    }
    debug!(target: "dispatch", "Unknown command: {}", ctx.msg);

    let mut reply = Message::reply_to(ctx.msg);

    reply.set_command("UNKNOWN");
    reply.set_parameter("command", ctx.msg.command());
    ctx.reply(&reply);
}
