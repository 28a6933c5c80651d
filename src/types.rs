//! Reply values, argument conversion and the crate-wide error type.

use num_bigint::BigInt;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type RedisResult<T> = Result<T, RedisError>;

/// The protocol level negotiated with the server via `HELLO`.
///
/// Fixed for the lifetime of a connection once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// The original protocol: arrays, bulk strings, integers and statuses.
    Resp2,
    /// RESP3: adds typed values (map, set, double, boolean, null, big
    /// number, verbatim) and server-initiated push frames.
    Resp3,
}

/// Kind of a RESP3 push frame (or a RESP2 frame repurposed as one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    /// `message` — a pub/sub message on a subscribed channel.
    Message,
    /// `pmessage` — a pub/sub message matched by a subscribed pattern.
    PMessage,
    /// `smessage` — a sharded pub/sub message.
    SMessage,
    /// Confirmation of a `SUBSCRIBE`.
    Subscribe,
    /// Confirmation of a `PSUBSCRIBE`.
    PSubscribe,
    /// Confirmation of an `SSUBSCRIBE`.
    SSubscribe,
    /// Confirmation of an `UNSUBSCRIBE`.
    Unsubscribe,
    /// Confirmation of a `PUNSUBSCRIBE`.
    PUnsubscribe,
    /// Confirmation of an `SUNSUBSCRIBE`.
    SUnsubscribe,
    /// `invalidate` — client-side cache invalidation.
    Invalidate,
    /// Any other event name.
    Other(String),
}

impl PushKind {
    /// Maps a wire-level event name onto a kind.
    pub fn from_name(name: &[u8]) -> PushKind {
        match name {
            b"message" => PushKind::Message,
            b"pmessage" => PushKind::PMessage,
            b"smessage" => PushKind::SMessage,
            b"subscribe" => PushKind::Subscribe,
            b"psubscribe" => PushKind::PSubscribe,
            b"ssubscribe" => PushKind::SSubscribe,
            b"unsubscribe" => PushKind::Unsubscribe,
            b"punsubscribe" => PushKind::PUnsubscribe,
            b"sunsubscribe" => PushKind::SUnsubscribe,
            b"invalidate" => PushKind::Invalidate,
            other => PushKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// Format tag of a RESP3 verbatim string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbatimFormat {
    /// `txt`
    Text,
    /// `mkd`
    Markdown,
    /// Any other three-byte tag.
    Unknown(String),
}

/// An error reply sent by the server, either as a top-level `-` line, a
/// RESP3 blob error, or an element of an aggregate (e.g. inside the reply
/// to `EXEC`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    code: String,
    detail: Option<String>,
}

impl ServerError {
    pub(crate) fn new(code: String, detail: Option<String>) -> ServerError {
        ServerError { code, detail }
    }

    /// Parses the text of an error reply. The first word is the error
    /// code, the remainder the detail.
    pub(crate) fn from_text(text: &str) -> ServerError {
        match text.split_once(' ') {
            Some((code, detail)) => ServerError::new(code.to_string(), Some(detail.to_string())),
            None => ServerError::new(text.to_string(), None),
        }
    }

    /// The error code, e.g. `ERR` or `WRONGTYPE`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The error detail following the code, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} {}", self.code, detail),
            None => write!(f, "{}", self.code),
        }
    }
}

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A nil bulk string, nil array, or RESP3 null.
    Nil,
    /// A signed 64 bit integer.
    Int(i64),
    /// An opaque byte sequence.
    BulkString(Vec<u8>),
    /// An ordered sequence of values.
    Array(Vec<Value>),
    /// A textual status reply other than `OK`.
    SimpleString(String),
    /// The `+OK` status.
    Okay,
    /// A RESP3 map. Wire order is preserved; keys are not required to be
    /// unique, conversions treat duplicates as last-wins.
    Map(Vec<(Value, Value)>),
    /// A RESP3 set, in wire order.
    Set(Vec<Value>),
    /// A RESP3 double.
    Double(f64),
    /// A RESP3 boolean.
    Boolean(bool),
    /// A RESP3 verbatim string with its format tag.
    VerbatimString {
        /// Three-byte format tag.
        format: VerbatimFormat,
        /// Payload following the tag.
        text: String,
    },
    /// A RESP3 big number, kept as an arbitrary-precision integer.
    BigNumber(BigInt),
    /// An error reply. Top-level occurrences fail the pending request
    /// they resolve; nested occurrences stay values.
    ServerError(ServerError),
    /// RESP3 out-of-band metadata attached to the following value.
    Attribute {
        /// The actual reply the attribute decorates.
        data: Box<Value>,
        /// The attribute pairs, in wire order.
        attributes: Vec<(Value, Value)>,
    },
    /// A RESP3 push frame. `data` holds the elements after the event name.
    Push {
        /// The push event kind (first element of the frame).
        kind: PushKind,
        /// Remaining elements of the frame.
        data: Vec<Value>,
    },
}

impl Value {
    /// Converts a top-level `ServerError` into a failure, passing every
    /// other value through.
    pub fn extract_error(self) -> RedisResult<Value> {
        match self {
            Value::ServerError(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    /// The raw bytes of a string-ish value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(text) => Some(text.as_bytes()),
            Value::Okay => Some(b"OK"),
            Value::VerbatimString { text, .. } => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Looks a key up in a map reply; with duplicate keys the last
    /// occurrence wins.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .rev()
                .find(|(k, _)| k.as_bytes() == Some(key.as_bytes()))
                .map(|(_, v)| v),
            Value::Attribute { data, .. } => data.lookup(key),
            _ => None,
        }
    }
}

/// Classification of a [`RedisError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, read or write I/O failure.
    Transport,
    /// The decoder rejected bytes from the server.
    Protocol,
    /// A server-reported error reply, or one synthesized on teardown.
    Redis,
    /// The command is invalid in the connection's current mode.
    Usage,
    /// The caller withdrew interest before the reply arrived.
    Cancelled,
}

enum ErrorRepr {
    Transport(io::Error),
    Protocol(Cow<'static, str>),
    Redis {
        message: String,
        disconnected: bool,
    },
    Usage {
        message: String,
        counts: Option<(usize, usize)>,
    },
    Cancelled,
}

/// The composite error value every fallible operation in this crate
/// reports: a kind, a message, and auxiliary fields (the `disconnected`
/// tag for teardown errors, subscription counts for the RESP2 pub/sub
/// lockout).
pub struct RedisError {
    repr: ErrorRepr,
}

impl RedisError {
    /// The error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Transport(_) => ErrorKind::Transport,
            ErrorRepr::Protocol(_) => ErrorKind::Protocol,
            ErrorRepr::Redis { .. } => ErrorKind::Redis,
            ErrorRepr::Usage { .. } => ErrorKind::Usage,
            ErrorRepr::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True for errors synthesized when the connection went away.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.repr, ErrorRepr::Redis { disconnected: true, .. })
    }

    /// `(channels, patterns)` counts attached to a pub/sub lockout error.
    pub fn subscription_counts(&self) -> Option<(usize, usize)> {
        match self.repr {
            ErrorRepr::Usage { counts, .. } => counts,
            _ => None,
        }
    }

    /// The error message without the kind prefix.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Protocol(message) => Some(message),
            ErrorRepr::Redis { message, .. } => Some(message),
            ErrorRepr::Usage { message, .. } => Some(message),
            _ => None,
        }
    }

    pub(crate) fn disconnected() -> RedisError {
        RedisError {
            repr: ErrorRepr::Redis {
                message: "Server connection is no longer active".to_string(),
                disconnected: true,
            },
        }
    }

    pub(crate) fn subscriber_lockout(command: &str, channels: usize, patterns: usize) -> RedisError {
        RedisError {
            repr: ErrorRepr::Usage {
                message: format!("Cannot send {command} while subscribed"),
                counts: Some((channels, patterns)),
            },
        }
    }

    pub(crate) fn is_unknown_command(&self) -> bool {
        matches!(&self.repr, ErrorRepr::Redis { message, .. } if message.starts_with("ERR unknown command"))
    }
}

impl Clone for RedisError {
    fn clone(&self) -> RedisError {
        let repr = match &self.repr {
            ErrorRepr::Transport(err) => {
                ErrorRepr::Transport(io::Error::new(err.kind(), err.to_string()))
            }
            ErrorRepr::Protocol(message) => ErrorRepr::Protocol(message.clone()),
            ErrorRepr::Redis {
                message,
                disconnected,
            } => ErrorRepr::Redis {
                message: message.clone(),
                disconnected: *disconnected,
            },
            ErrorRepr::Usage { message, counts } => ErrorRepr::Usage {
                message: message.clone(),
                counts: *counts,
            },
            ErrorRepr::Cancelled => ErrorRepr::Cancelled,
        };
        RedisError { repr }
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Transport(err) => write!(f, "transport error: {err}"),
            ErrorRepr::Protocol(message) => write!(f, "protocol error: {message}"),
            ErrorRepr::Redis {
                message,
                disconnected,
            } => {
                write!(f, "{message}")?;
                if *disconnected {
                    write!(f, " (disconnected)")?;
                }
                Ok(())
            }
            ErrorRepr::Usage { message, counts } => {
                write!(f, "{message}")?;
                if let Some((channels, patterns)) = counts {
                    write!(f, " (channels={channels}, patterns={patterns})")?;
                }
                Ok(())
            }
            ErrorRepr::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind(), self)
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::Transport(err),
        }
    }
}

impl From<ServerError> for RedisError {
    fn from(err: ServerError) -> RedisError {
        RedisError {
            repr: ErrorRepr::Redis {
                message: err.to_string(),
                disconnected: false,
            },
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, message): (ErrorKind, &'static str)) -> RedisError {
        (kind, message, None).into()
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, message, detail): (ErrorKind, &'static str, String)) -> RedisError {
        (kind, message, Some(detail)).into()
    }
}

impl From<(ErrorKind, &'static str, Option<String>)> for RedisError {
    fn from((kind, message, detail): (ErrorKind, &'static str, Option<String>)) -> RedisError {
        let text = match detail {
            Some(detail) => format!("{message}: {detail}"),
            None => message.to_string(),
        };
        let repr = match kind {
            ErrorKind::Transport => ErrorRepr::Transport(io::Error::other(text)),
            ErrorKind::Protocol => ErrorRepr::Protocol(Cow::Owned(text)),
            ErrorKind::Redis => ErrorRepr::Redis {
                message: text,
                disconnected: false,
            },
            ErrorKind::Usage => ErrorRepr::Usage {
                message: text,
                counts: None,
            },
            ErrorKind::Cancelled => ErrorRepr::Cancelled,
        };
        RedisError { repr }
    }
}

/// Conversion of call-site arguments into command arguments.
///
/// Every argument is rendered as one or more byte strings; commands are
/// always emitted as arrays of bulk strings.
pub trait ToRedisArgs {
    /// Appends this value's byte representation(s) to `out`.
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>);
}

impl<T: ToRedisArgs + ?Sized> ToRedisArgs for &T {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        T::write_redis_args(*self, out)
    }
}

impl ToRedisArgs for str {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec())
    }
}

impl ToRedisArgs for String {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.as_bytes().to_vec())
    }
}

impl ToRedisArgs for [u8] {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec())
    }
}

impl ToRedisArgs for Vec<u8> {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.clone())
    }
}

impl<const N: usize> ToRedisArgs for [u8; N] {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        out.push(self.to_vec())
    }
}

macro_rules! integer_to_redis_args {
    ($($ty:ty),*) => {
        $(
            impl ToRedisArgs for $ty {
                fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
                    let mut buf = ::itoa::Buffer::new();
                    out.push(buf.format(*self).as_bytes().to_vec())
                }
            }
        )*
    };
}

integer_to_redis_args!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl ToRedisArgs for f64 {
    fn write_redis_args(&self, out: &mut Vec<Vec<u8>>) {
        let mut buf = ryu::Buffer::new();
        out.push(buf.format(*self).as_bytes().to_vec())
    }
}
