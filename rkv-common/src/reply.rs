//! # Reply Model
//!
//! Decoded wire values for both protocol revisions. Every reply is exactly one
//! variant; the null reply is its own variant rather than an empty payload.

use std::fmt;

use bytes::Bytes;

/// One decoded RESP2/RESP3 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK` style status line.
    SimpleString(String),
    /// `-ERR ...` line or RESP3 `!` blob error.
    Error(String),
    /// `:123`
    Integer(i64),
    /// `,3.14` (RESP3), including `inf`, `-inf` and `nan`.
    Double(f64),
    /// `#t` / `#f` (RESP3).
    Boolean(bool),
    /// `(1234...` (RESP3), kept as text to avoid precision loss.
    BigNumber(String),
    /// `$<len>` binary-safe payload.
    BulkString(Bytes),
    /// `=<len>` (RESP3) with its three-letter format tag split off.
    Verbatim { format: String, text: Bytes },
    /// `$-1`, `*-1` (RESP2) or `_` (RESP3).
    Nil,
    /// `*<count>`
    Array(Vec<Reply>),
    /// `%<pairs>` (RESP3); order is preserved.
    Map(Vec<(Reply, Reply)>),
    /// `~<count>` (RESP3).
    Set(Vec<Reply>),
    /// `><count>` (RESP3) out-of-band message.
    Push(Vec<Reply>),
}

impl Reply {
    /// Builds a bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::BulkString(data.into())
    }

    /// Builds a status reply.
    pub fn simple(text: impl Into<String>) -> Self {
        Reply::SimpleString(text.into())
    }

    /// Builds an error reply.
    pub fn error(text: impl Into<String>) -> Self {
        Reply::Error(text.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Reply::Push(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns the payload of text-like scalars (status, bulk, verbatim).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::SimpleString(text) => Some(text.as_bytes()),
            Reply::BulkString(data) => Some(data),
            Reply::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Short name of the variant, used in decode error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::SimpleString(_) => "simple string",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Double(_) => "double",
            Reply::Boolean(_) => "boolean",
            Reply::BigNumber(_) => "big number",
            Reply::BulkString(_) => "bulk string",
            Reply::Verbatim { .. } => "verbatim string",
            Reply::Nil => "nil",
            Reply::Array(_) => "array",
            Reply::Map(_) => "map",
            Reply::Set(_) => "set",
            Reply::Push(_) => "push",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::SimpleString(text) | Reply::BigNumber(text) => f.write_str(text),
            Reply::Error(text) => write!(f, "(error) {}", text),
            Reply::Integer(value) => write!(f, "{}", value),
            Reply::Double(value) => write!(f, "{}", value),
            Reply::Boolean(value) => write!(f, "{}", value),
            Reply::BulkString(data) | Reply::Verbatim { text: data, .. } => {
                write!(f, "{}", String::from_utf8_lossy(data))
            }
            Reply::Nil => f.write_str("(nil)"),
            Reply::Array(items) | Reply::Set(items) | Reply::Push(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Reply::Map(pairs) => {
                f.write_str("{")?;
                for (idx, (key, value)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}
