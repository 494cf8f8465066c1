//! Core value and error types shared by every subsystem.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use bytes::Bytes;

use crate::zset::ZSet;

/// Keys are immutable byte strings; cloning is a refcount bump.
pub type Key = Bytes;

/// An error that can be shipped to a client as a `-TAG message` reply.
///
/// The first word of the wire form is a stable tag and part of the wire
/// contract; everything after it is advisory text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    kind: ErrorKind,
    detail: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Catch-all `ERR`.
    Generic,
    /// Malformed frame or inline line.
    Protocol,
    /// Recognized command, unusable arguments.
    Syntax,
    WrongType,
    BusyKey,
    NoAuth,
    NoPerm,
    WrongPass,
    /// Swap back-pressure told the client to come back later.
    RetryLater,
    OutOfMemory,
    MaxClients,
    ReadOnly,
    /// Swap backend or migrate socket failure.
    Io,
}

impl ErrorKind {
    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::Generic => "ERR",
            ErrorKind::Protocol => "ERR",
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::WrongType => "WRONGTYPE",
            ErrorKind::BusyKey => "BUSYKEY",
            ErrorKind::NoAuth => "NOAUTH",
            ErrorKind::NoPerm => "NOPERM",
            ErrorKind::WrongPass => "WRONGPASS",
            ErrorKind::RetryLater => "RETRYLATER",
            ErrorKind::OutOfMemory => "OOM",
            ErrorKind::MaxClients => "ERR",
            ErrorKind::ReadOnly => "READONLY",
            ErrorKind::Io => "IOERR",
        }
    }
}

impl ServerError {
    pub fn new(kind: ErrorKind, detail: impl Into<Cow<'static, str>>) -> Self {
        ServerError { kind, detail: detail.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// The `TAG message` string sent after the `-` marker.
    pub fn wire(&self) -> String {
        format!("{} {}", self.kind.tag(), self.detail)
    }

    pub fn wrong_type() -> Self {
        ServerError::new(
            ErrorKind::WrongType,
            "Operation against a key holding the wrong kind of value",
        )
    }

    pub fn syntax() -> Self {
        ServerError::new(ErrorKind::Syntax, "syntax error")
    }

    pub fn unknown_command(name: &[u8]) -> Self {
        ServerError::new(
            ErrorKind::Generic,
            format!("unknown command '{}'", String::from_utf8_lossy(name)),
        )
    }

    pub fn wrong_arity(name: &str) -> Self {
        ServerError::new(
            ErrorKind::Generic,
            format!("wrong number of arguments for '{}' command", name),
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.tag(), self.detail)
    }
}

impl std::error::Error for ServerError {}

pub type ServerResult<T> = Result<T, ServerError>;

/// String payloads keep small integers inline instead of going through a
/// shared-object table.
#[derive(Debug, Clone, PartialEq)]
pub enum StrVal {
    Int(i64),
    Raw(Bytes),
}

impl StrVal {
    /// Decide the cheapest representation for freshly written bytes.
    pub fn from_bytes(bytes: Bytes) -> StrVal {
        if !bytes.is_empty() && bytes.len() <= 20 {
            if let Ok(s) = std::str::from_utf8(&bytes) {
                if let Ok(n) = s.parse::<i64>() {
                    // Reject representations that do not round-trip, like
                    // leading zeros or a leading plus.
                    if itoa::Buffer::new().format(n).as_bytes() == &bytes[..] {
                        return StrVal::Int(n);
                    }
                }
            }
        }
        StrVal::Raw(bytes)
    }

    /// Materialize the decimal form; `Raw` is returned as-is.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            StrVal::Int(n) => Bytes::copy_from_slice(itoa::Buffer::new().format(*n).as_bytes()),
            StrVal::Raw(b) => b.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StrVal::Int(n) => itoa::Buffer::new().format(*n).len(),
            StrVal::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StrVal::Int(_) => false,
            StrVal::Raw(b) => b.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: (u64, u64),
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stream {
    pub last_id: (u64, u64),
    pub entries: Vec<StreamEntry>,
}

/// The tagged value variant stored under each key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(StrVal),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    ZSet(ZSet),
    Hash(HashMap<Bytes, Bytes>),
    Stream(Stream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
}

impl ValueKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::ZSet => "zset",
            ValueKind::Hash => "hash",
            ValueKind::Stream => "stream",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::ZSet(_) => ValueKind::ZSet,
            Value::Hash(_) => ValueKind::Hash,
            Value::Stream(_) => ValueKind::Stream,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    /// Rough payload footprint used for maxmemory accounting and the
    /// in-flight swap-memory gauge.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Str(s) => s.len() + 16,
            Value::List(l) => l.iter().map(|e| e.len() + 16).sum::<usize>() + 32,
            Value::Set(s) => s.iter().map(|e| e.len() + 24).sum::<usize>() + 32,
            Value::ZSet(z) => z.approx_size(),
            Value::Hash(h) => h.iter().map(|(k, v)| k.len() + v.len() + 32).sum::<usize>() + 32,
            Value::Stream(s) => {
                s.entries
                    .iter()
                    .map(|e| {
                        e.fields.iter().map(|(k, v)| k.len() + v.len() + 16).sum::<usize>() + 32
                    })
                    .sum::<usize>()
                    + 32
            }
        }
    }
}

/// A materialized keyspace entry: the value plus its swap metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub value: Value,
    /// Modified since the last successful swap-out; clean values can be
    /// dropped from memory without backing-store I/O.
    pub dirty: bool,
    /// Last-touch clock for LRU eviction sampling, in ms.
    pub lru: i64,
}

impl Object {
    pub fn new(value: Value, now: i64) -> Self {
        Object { value, dirty: true, lru: now }
    }

    pub fn approx_size(&self) -> usize {
        self.value.approx_size()
    }
}
