//! Bus message: routing envelope, command and named parameters.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;

use crate::wire;

/// Version of the message envelope carried in the `version` parameter.
pub const MESSAGE_VERSION: i64 = 1;

/// Errors from building or decoding messages.
#[derive(Error, Debug)]
pub enum MessageError {
    /// A message cannot be transmitted without a command.
    #[error("message has no command")]
    MissingCommand,

    /// Parameter or command name outside `[A-Za-z_][A-Za-z0-9_]*`.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// The line does not follow the text wire format.
    #[error("invalid message: {0:?}")]
    InvalidFormat(String),

    /// A percent-escape could not be decoded.
    #[error("invalid escape in value: {0:?}")]
    InvalidEscape(String),

    /// A parameter did not parse as the requested type.
    #[error("parameter {name:?} is not a valid {expected}: {value:?}")]
    InvalidParameter {
        name: String,
        expected: &'static str,
        value: String,
    },

    /// The line looked like JSON but was not a valid message object.
    #[error("invalid json message: {0}")]
    Json(String),

    /// A string did not parse as an endpoint.
    #[error("invalid endpoint: {0:?}")]
    InvalidEndpoint(String),
}

/// Wire encoding of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `server:service/COMMAND name=value;...` line format.
    Text,
    /// One-line JSON object.
    Json,
}

/// A second/nanosecond timestamp, carried as `secs.nanos` in parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

impl FromStr for Timespec {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, nanos) = s.split_once('.').ok_or(())?;
        let secs = secs.parse::<i64>().map_err(|_| ())?;
        // Right-pad so "1.5" means 1.500000000.
        let mut nanos = nanos.to_string();
        if nanos.len() > 9 || nanos.chars().any(|c| !c.is_ascii_digit()) {
            return Err(());
        }
        while nanos.len() < 9 {
            nanos.push('0');
        }
        let nanos = nanos.parse::<u32>().map_err(|_| ())?;

        Ok(Self { secs, nanos })
    }
}

/// A named message exchanged between services and daemons.
///
/// The destination is `server`/`service`; an empty service or `"."` means
/// the local daemon, `"*"` every server, `"?"` every server except the
/// sender. The origin (`sent_from_*`) is stamped by the daemon on the way
/// through so the receiver can address a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    sent_from_server: String,
    sent_from_service: String,
    server: String,
    service: String,
    command: String,
    parameters: BTreeMap<String, String>,
}

impl Message {
    /// New message with the given command and no destination.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// New message addressed as a reply to `msg`: the source of `msg`
    /// becomes the destination, and the reply's own source is left empty.
    pub fn reply_to(msg: &Message) -> Self {
        Self {
            server: msg.sent_from_server.clone(),
            service: msg.sent_from_service.clone(),
            ..Self::default()
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn set_command(&mut self, command: impl Into<String>) -> &mut Self {
        self.command = command.into();
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn set_server(&mut self, server: impl Into<String>) -> &mut Self {
        self.server = server.into();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_service(&mut self, service: impl Into<String>) -> &mut Self {
        self.service = service.into();
        self
    }

    pub fn sent_from_server(&self) -> &str {
        &self.sent_from_server
    }

    pub fn set_sent_from_server(&mut self, server: impl Into<String>) -> &mut Self {
        self.sent_from_server = server.into();
        self
    }

    pub fn sent_from_service(&self) -> &str {
        &self.sent_from_service
    }

    pub fn set_sent_from_service(&mut self, service: impl Into<String>) -> &mut Self {
        self.sent_from_service = service.into();
        self
    }

    /// Whether the destination service means "this daemon".
    pub fn is_for_daemon(&self) -> bool {
        self.service.is_empty() || self.service == "."
    }

    /// Whether the destination service is one of the broadcast forms.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.service.as_str(), "." | "*" | "?")
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Set a parameter. Names are code constants; an invalid one is a bug.
    pub fn set_parameter(&mut self, name: &str, value: impl ToString) -> &mut Self {
        debug_assert!(wire::valid_name(name), "invalid parameter name {name:?}");

        if wire::valid_name(name) {
            self.parameters.insert(name.to_string(), value.to_string());
        }
        self
    }

    pub fn remove_parameter(&mut self, name: &str) -> &mut Self {
        self.parameters.remove(name);
        self
    }

    /// Integer parameter; a leading `+` is accepted.
    pub fn integer_parameter(&self, name: &str) -> Result<i64, MessageError> {
        let value = self.parameter(name).ok_or_else(|| MessageError::InvalidParameter {
            name: name.to_string(),
            expected: "integer",
            value: String::new(),
        })?;

        value
            .strip_prefix('+')
            .unwrap_or(value)
            .parse::<i64>()
            .map_err(|_| MessageError::InvalidParameter {
                name: name.to_string(),
                expected: "integer",
                value: value.to_string(),
            })
    }

    /// `secs.nanos` timestamp parameter.
    pub fn timespec_parameter(&self, name: &str) -> Result<Timespec, MessageError> {
        let value = self.parameter(name).unwrap_or("");

        Timespec::from_str(value).map_err(|_| MessageError::InvalidParameter {
            name: name.to_string(),
            expected: "timestamp",
            value: value.to_string(),
        })
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Stamp the envelope version parameter.
    pub fn add_version_parameter(&mut self) -> &mut Self {
        self.set_parameter("version", MESSAGE_VERSION)
    }

    /// Envelope version, if the message carries one.
    pub fn version(&self) -> Option<i64> {
        self.integer_parameter("version").ok()
    }

    /// Whether the envelope version is absent or current.
    pub fn check_version_parameter(&self) -> bool {
        match self.version() {
            Some(v) => v == MESSAGE_VERSION,
            None => !self.has_parameter("version"),
        }
    }

    /// Serialize in the given wire format, without a trailing newline.
    pub fn serialize(&self, format: Format) -> Result<String, MessageError> {
        match format {
            Format::Text => self.to_text(),
            Format::Json => self.to_json(),
        }
    }

    /// Parse one line, auto-detecting JSON by its leading `{`.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.starts_with('{') {
            Self::from_json(line)
        } else {
            Self::from_text(line)
        }
    }

    /// Text wire format:
    /// `[from_server:from_service ][server:]service/COMMAND[ n=v;n=v]`.
    pub fn to_text(&self) -> Result<String, MessageError> {
        if self.command.is_empty() {
            return Err(MessageError::MissingCommand);
        }

        let mut line = String::new();

        if !self.sent_from_server.is_empty() || !self.sent_from_service.is_empty() {
            line.push_str(&self.sent_from_server);
            line.push(':');
            line.push_str(&self.sent_from_service);
            line.push(' ');
        }
        if !self.server.is_empty() {
            line.push_str(&self.server);
            line.push(':');
            line.push_str(&self.service);
            line.push('/');
        } else if !self.service.is_empty() {
            line.push_str(&self.service);
            line.push('/');
        }
        line.push_str(&self.command);

        let mut first = true;
        for (name, value) in &self.parameters {
            line.push(if first { ' ' } else { ';' });
            first = false;

            line.push_str(name);
            line.push('=');
            line.push_str(&wire::escape(value));
        }

        Ok(line)
    }

    /// Parse the text wire format.
    pub fn from_text(line: &str) -> Result<Self, MessageError> {
        let mut msg = Self::default();
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if rest.is_empty() {
            return Err(MessageError::InvalidFormat(line.to_string()));
        }

        // Optional origin prefix: a first token holding `:` but neither a
        // destination `/` nor a parameter `=`.
        if let Some((head, tail)) = rest.split_once(' ') {
            if head.contains(':') && !head.contains('/') && !head.contains('=') {
                let (from_server, from_service) = head
                    .split_once(':')
                    .ok_or_else(|| MessageError::InvalidFormat(line.to_string()))?;

                msg.sent_from_server = from_server.to_string();
                msg.sent_from_service = from_service.to_string();
                rest = tail;
            }
        }

        let (address, params) = match rest.split_once(' ') {
            Some((address, params)) => (address, Some(params)),
            None => (rest, None),
        };

        let command = match address.split_once('/') {
            Some((destination, command)) => {
                match destination.split_once(':') {
                    Some((server, service)) => {
                        msg.server = server.to_string();
                        msg.service = service.to_string();
                    }
                    None => msg.service = destination.to_string(),
                }
                command
            }
            None => address,
        };
        if command.is_empty() {
            return Err(MessageError::MissingCommand);
        }
        msg.command = command.to_string();

        if let Some(params) = params {
            for param in params.split(';') {
                let (name, value) = param
                    .split_once('=')
                    .ok_or_else(|| MessageError::InvalidFormat(line.to_string()))?;

                if !wire::valid_name(name) {
                    return Err(MessageError::InvalidName(name.to_string()));
                }
                msg.parameters
                    .insert(name.to_string(), wire::unescape(value)?);
            }
        }

        Ok(msg)
    }

    /// One-line JSON object form.
    pub fn to_json(&self) -> Result<String, MessageError> {
        if self.command.is_empty() {
            return Err(MessageError::MissingCommand);
        }

        let mut object = json!({ "command": self.command });

        let fields = [
            ("server", &self.server),
            ("service", &self.service),
            ("sent_from_server", &self.sent_from_server),
            ("sent_from_service", &self.sent_from_service),
        ];
        for (key, value) in fields {
            if !value.is_empty() {
                object[key] = json!(value);
            }
        }
        if !self.parameters.is_empty() {
            object["parameters"] = json!(self.parameters);
        }

        Ok(object.to_string())
    }

    /// Parse the JSON object form.
    pub fn from_json(line: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| MessageError::Json(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| MessageError::Json("not an object".to_string()))?;

        let text_field = |name: &str| -> String {
            object
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let mut msg = Self {
            command: text_field("command"),
            server: text_field("server"),
            service: text_field("service"),
            sent_from_server: text_field("sent_from_server"),
            sent_from_service: text_field("sent_from_service"),
            parameters: BTreeMap::new(),
        };
        if msg.command.is_empty() {
            return Err(MessageError::MissingCommand);
        }

        if let Some(params) = object.get("parameters") {
            let params = params
                .as_object()
                .ok_or_else(|| MessageError::Json("parameters is not an object".to_string()))?;

            for (name, value) in params {
                if !wire::valid_name(name) {
                    return Err(MessageError::InvalidName(name.clone()));
                }
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return Err(MessageError::Json(format!("bad value for {name:?}"))),
                };
                msg.parameters.insert(name.clone(), value);
            }
        }

        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Ok(line) => write!(f, "{}", line),
            Err(_) => write!(f, "(no command)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_fields() {
        let mut msg = Message::default();

        assert!(msg.sent_from_server().is_empty());
        msg.set_sent_from_server("remote");
        assert_eq!(msg.sent_from_server(), "remote");

        msg.set_sent_from_service("firewall");
        assert_eq!(msg.sent_from_service(), "firewall");

        msg.set_server("jungle");
        assert_eq!(msg.server(), "jungle");

        msg.set_service("watchdog");
        assert_eq!(msg.service(), "watchdog");

        msg.set_command("CONNECT");
        assert_eq!(msg.command(), "CONNECT");

        msg.add_version_parameter();
        assert!(msg.check_version_parameter());
        assert_eq!(msg.version(), Some(MESSAGE_VERSION));
    }

    #[test]
    fn test_parameters() {
        let mut msg = Message::new("FIRE");

        assert!(!msg.has_parameter("speed"));
        msg.set_parameter("speed", 1078);
        assert!(msg.has_parameter("speed"));
        assert_eq!(msg.parameter("speed"), Some("1078"));
        assert_eq!(msg.integer_parameter("speed").unwrap(), 1078);

        msg.set_parameter("length", -35);
        assert_eq!(msg.parameter("length"), Some("-35"));
        assert_eq!(msg.integer_parameter("length").unwrap(), -35);

        msg.set_parameter("range", "+101");
        assert_eq!(msg.parameter("range"), Some("+101"));
        assert_eq!(msg.integer_parameter("range").unwrap(), 101);

        msg.set_parameter("huge", 7428447997487423361i64);
        assert_eq!(msg.integer_parameter("huge").unwrap(), 7428447997487423361);

        let now = Timespec::new(1680063232, 123456789);
        msg.set_parameter("date", now);
        assert_eq!(msg.parameter("date"), Some("1680063232.123456789"));
        assert_eq!(msg.timespec_parameter("date").unwrap(), now);

        msg.set_parameter("void", "");
        assert_eq!(msg.parameter("void"), Some(""));

        assert!(msg.integer_parameter("missing").is_err());
        assert!(msg.integer_parameter("range").is_ok());
    }

    #[test]
    fn test_reply_to() {
        let mut msg = Message::new("ALIVE");

        msg.set_sent_from_server("remote")
            .set_sent_from_service("firewall")
            .set_server("jungle")
            .set_service("watchdog")
            .set_parameter("serial", 17);

        let reply = Message::reply_to(&msg);

        assert!(reply.sent_from_server().is_empty());
        assert!(reply.sent_from_service().is_empty());
        assert_eq!(reply.server(), "remote");
        assert_eq!(reply.service(), "firewall");
        assert!(reply.command().is_empty());
        assert!(reply.parameters().is_empty());

        // The source is untouched.
        assert_eq!(msg.server(), "jungle");
        assert_eq!(msg.service(), "watchdog");
    }

    fn roundtrip(msg: &Message) {
        let text = msg.serialize(Format::Text).unwrap();
        assert_eq!(&Message::parse(&text).unwrap(), msg);

        let j = msg.serialize(Format::Json).unwrap();
        assert!(j.starts_with('{'));
        assert_eq!(&Message::parse(&j).unwrap(), msg);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut msg = Message::new("FIRE");
        roundtrip(&msg);

        msg.set_parameter("name", "Charles");
        msg.set_parameter("length", -35);
        msg.set_parameter("valid", "true");
        msg.set_parameter("void", "");
        msg.set_parameter("spaced", "a b;c=d %");
        roundtrip(&msg);

        msg.set_service("watchdog");
        roundtrip(&msg);

        msg.set_server("jungle");
        roundtrip(&msg);

        msg.set_sent_from_server("remote");
        msg.set_sent_from_service("firewall");
        roundtrip(&msg);
    }

    #[test]
    fn test_text_forms() {
        let msg = Message::parse("HELLO").unwrap();
        assert_eq!(msg.command(), "HELLO");
        assert!(msg.service().is_empty());

        let msg = Message::parse("watchdog/STOP\n").unwrap();
        assert_eq!(msg.command(), "STOP");
        assert_eq!(msg.service(), "watchdog");

        let msg = Message::parse("jungle:watchdog/STATUS service=fw;status=up").unwrap();
        assert_eq!(msg.server(), "jungle");
        assert_eq!(msg.service(), "watchdog");
        assert_eq!(msg.command(), "STATUS");
        assert_eq!(msg.parameter("status"), Some("up"));

        let msg = Message::parse("remote:firewall STATUS status=down").unwrap();
        assert_eq!(msg.sent_from_server(), "remote");
        assert_eq!(msg.sent_from_service(), "firewall");
        assert_eq!(msg.command(), "STATUS");

        assert!(Message::parse("").is_err());
        assert!(Message::parse("watchdog/").is_err());
        assert!(Message::parse("CMD bad param").is_err());
        assert!(Message::parse("CMD 9bad=value").is_err());
    }

    #[test]
    fn test_json_detection() {
        let msg = Message::parse(r#"{"command":"FIRE","service":"watchdog","parameters":{"length":-35}}"#)
            .unwrap();

        assert_eq!(msg.command(), "FIRE");
        assert_eq!(msg.service(), "watchdog");
        assert_eq!(msg.integer_parameter("length").unwrap(), -35);

        assert!(Message::parse("{not json").is_err());
        assert!(Message::parse(r#"{"service":"x"}"#).is_err());
    }
}
