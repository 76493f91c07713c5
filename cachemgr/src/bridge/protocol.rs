//! Wire protocol types for the manager-worker command channel.
//!
//! One request line per command, one reply line per request:
//!
//! ```text
//! manager -> worker:  <verb> [<escaped-arg> ...]\n
//! worker -> manager:  <status> <escaped-message>\n
//! ```
//!
//! Replies carry no correlation id; they match requests by order only.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, BytesMut};

use super::escape::{self, EscapeError};

/// Numeric reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const SYNTAX: Status = Status(100);
    pub const UNKNOWN: Status = Status(101);
    pub const UNIMPLEMENTED: Status = Status(102);
    pub const TOO_FEW: Status = Status(104);
    pub const TOO_MANY: Status = Status(105);
    pub const PARAM: Status = Status(106);
    pub const OK: Status = Status(200);
    pub const TRUNCATED: Status = Status(201);
    pub const CANT: Status = Status(300);
    /// Channel to the worker was lost before the reply arrived.
    pub const COMMS: Status = Status(400);
    pub const CLOSE: Status = Status(500);

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol-level failures on the command channel.
///
/// Any of these on the reply path ends the current worker incarnation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid verb {0:?}")]
    InvalidVerb(String),
    #[error("empty request line")]
    EmptyRequest,
    #[error("malformed reply status {0:?}")]
    MalformedStatus(String),
    #[error("malformed escaping: {0}")]
    Escape(#[from] EscapeError),
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("reply received with no command in flight")]
    UnmatchedReply,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    verb: String,
    args: Vec<Vec<u8>>,
}

impl Request {
    /// Build a request, rejecting verbs that would not survive the wire
    /// as a single bare token.
    pub fn new<I, A>(verb: impl Into<String>, args: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        let verb = verb.into();
        if escape::needs_quoting(verb.as_bytes()) {
            return Err(ProtocolError::InvalidVerb(verb));
        }
        Ok(Self {
            verb,
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Heartbeat ping carrying a unix timestamp.
    pub fn ping(unix_secs: i64) -> Self {
        Self {
            verb: "ping".to_string(),
            args: vec![unix_secs.to_string().into_bytes()],
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Append the wire line, newline included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.verb.as_bytes());
        for arg in &self.args {
            dst.put_u8(b' ');
            escape::encode_token(arg, dst);
        }
        dst.put_u8(b'\n');
    }

    /// Parse a request line (without its newline).
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let mut tokens = escape::split_tokens(line)?.into_iter();
        let verb = tokens.next().ok_or(ProtocolError::EmptyRequest)?;
        let verb = String::from_utf8(verb)
            .map_err(|e| ProtocolError::InvalidVerb(String::from_utf8_lossy(e.as_bytes()).into()))?;
        Self::new(verb, tokens)
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        let line = String::from_utf8_lossy(&buf);
        f.write_str(line.trim_end_matches('\n'))
    }
}

/// A request line as read by the worker.
///
/// Parse failures are kept so the worker can answer them and keep reply
/// order intact.
#[derive(Debug)]
pub enum IncomingRequest {
    Request(Request),
    Malformed(ProtocolError),
}

/// A worker reply to the oldest in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub message: String,
}

impl Reply {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::OK, message)
    }

    pub fn pong(message: impl Into<String>) -> Self {
        Self::ok(format!("PONG {}", message.into()))
    }

    /// Reply synthesized for commands lost with a worker incarnation.
    pub fn channel_reset() -> Self {
        Self::new(Status::COMMS, "worker channel reset")
    }

    /// Cut the message to at most `limit` bytes and mark the reply
    /// truncated. Shorter messages pass through untouched.
    pub fn truncate_to(mut self, limit: usize) -> Self {
        if self.message.len() <= limit {
            return self;
        }
        let mut end = limit;
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        self.message.truncate(end);
        self.status = Status::TRUNCATED;
        self
    }

    /// Append the wire line, newline included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.status.0.to_string().as_bytes());
        dst.put_u8(b' ');
        escape::encode_token(self.message.as_bytes(), dst);
        dst.put_u8(b'\n');
    }

    /// Parse a reply line (without its newline).
    ///
    /// The message is the remainder after the status and one separator. A
    /// remainder starting with `"` must be exactly one quoted token; anything
    /// else is taken verbatim.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let split = line
            .iter()
            .position(|&b| b == b' ' || b == b'\t')
            .unwrap_or(line.len());
        let (digits, rest) = line.split_at(split);

        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::MalformedStatus(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        let code = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                ProtocolError::MalformedStatus(String::from_utf8_lossy(digits).into_owned())
            })?;

        let rest = rest.get(1..).unwrap_or_default();
        let message = escape::decode_token(rest)?;

        Ok(Self {
            status: Status(code),
            message: String::from_utf8_lossy(&message).into_owned(),
        })
    }
}
