//! # Converted Values
//!
//! Typed values produced by the result converter. `Value::Nil` is the single
//! "absent" representation for scalars and whole collections alike.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::codec::{is_integer_text, parse_double};

/// A typed value shaped by a `ResultType`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent scalar or absent collection.
    Nil,
    String(String),
    Bytes(Bytes),
    Int(i64),
    Double(f64),
    Boolean(bool),
    Number(Number),
    Array(Vec<Value>),
    /// Map-shaped reply, order preserved.
    Map(Vec<(Value, Value)>),
    /// Key/value pair list (for example member/score pairs).
    Pairs(Vec<(Value, Value)>),
    Stream(Vec<StreamEntry>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            Value::Number(number) => number.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Bytes(data) => Some(data),
            Value::String(text) => Some(Bytes::from(text)),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the pairs of a `Map` or `Pairs` value.
    pub fn into_pairs(self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Map(pairs) | Value::Pairs(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "integer",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Pairs(_) => "pairs",
            Value::Stream(_) => "stream",
        }
    }
}

/// One stream entry: id plus field/value pairs.
///
/// `fields` is `None` when the server reports the entry id without a body
/// (the entry was deleted after being delivered).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Option<Vec<(Value, Value)>>,
}

/// Numeric reply kept as its wire text.
///
/// Interpretation is left to the caller so 64-bit integers beyond the exact
/// range of `f64` survive untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Number(String);

impl Number {
    /// Wraps `text` if it is an integer, a decimal, or `inf`/`-inf`/`nan`.
    pub fn new(text: impl Into<String>) -> Option<Number> {
        let text = text.into();
        if is_integer_text(text.as_bytes()) || parse_double(text.as_bytes()).is_some() {
            Some(Number(text))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.0.strip_prefix('+').unwrap_or(&self.0).parse().ok()
    }

    pub fn as_i128(&self) -> Option<i128> {
        self.0.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        parse_double(self.0.as_bytes())
    }

    /// Parses the wire text with `T`'s own `FromStr`.
    pub fn parse<T: FromStr>(&self) -> Result<T, T::Err> {
        self.0.parse()
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number(value.to_string())
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_keeps_large_integers_exact() {
        let number = Number::new("9007199254740993").unwrap();
        assert_eq!(number.as_i64(), Some(9_007_199_254_740_993));
        assert_eq!(number.as_str(), "9007199254740993");

        let unsigned = Number::new("18446744073709551615").unwrap();
        assert_eq!(unsigned.as_i64(), None);
        assert_eq!(unsigned.as_u64(), Some(u64::MAX));
    }

    #[test]
    fn number_rejects_non_numeric_text() {
        assert!(Number::new("12abc").is_none());
        assert!(Number::new("").is_none());
        assert!(Number::new("-inf").unwrap().as_f64().unwrap().is_infinite());
    }
}
