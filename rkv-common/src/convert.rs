//! # Result Conversion
//!
//! Purpose: Turn a decoded `Reply` into a typed `Value` according to a
//! `ResultType`, or fail with a decode error. Total over every supported flag
//! combination: any well-formed reply yields a value or an error, never a
//! panic.
//!
//! ## Design Principles
//! 1. **Container First**: the container flag picks the outer decoding and the
//!    scalar flag decodes the elements.
//! 2. **Nil Stays Nil**: a nil reply converts to `Value::Nil` whatever the
//!    target shape, so an absent list never looks like an empty one.
//! 3. **Exact Numbers**: `Number` keeps the wire text; `Double` understands
//!    `inf`, `-inf` and `nan` in any case.
//! 4. **Server Errors Surface**: an error reply reaching the converter is
//!    returned as `RkvError::Server`, not as a decode failure.

use bytes::Bytes;

use crate::codec::parse_double;
use crate::error::{RkvError, RkvResult};
use crate::reply::Reply;
use crate::result_type::{ResultType, Scalar, Shape};
use crate::value::{Number, StreamEntry, Value};

/// Converts `reply` into the shape described by `result_type`.
pub fn convert(reply: Reply, result_type: ResultType) -> RkvResult<Value> {
    let shape = result_type.shape()?;
    match reply {
        Reply::Nil => return Ok(Value::Nil),
        Reply::Error(message) => return Err(RkvError::Server(message)),
        _ => {}
    }

    match shape {
        Shape::Scalar(scalar) => convert_scalar(reply, scalar),
        Shape::Array(scalar) => {
            let items = expect_sequence(reply, "array")?;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(convert_scalar(item, scalar)?);
            }
            Ok(Value::Array(values))
        }
        Shape::Map(scalar) => Ok(Value::Map(convert_map(reply, scalar)?)),
        Shape::KeyValuePairs(scalar) => Ok(Value::Pairs(convert_pairs(reply, scalar)?)),
        Shape::ArrayOfMaps(scalar) => {
            let items = expect_sequence(reply, "array of maps")?;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let value = match item {
                    Reply::Nil => Value::Nil,
                    other => Value::Map(convert_map(other, scalar)?),
                };
                values.push(value);
            }
            Ok(Value::Array(values))
        }
        Shape::Stream(scalar) => convert_stream(reply, scalar),
    }
}

/// Types a converted value can be turned into by `call_number`-style callers.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> RkvResult<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> RkvResult<T> {
    if value.is_nil() {
        return Err(RkvError::decode(format!(
            "nil reply where a non-optional {} was expected",
            expected
        )));
    }
    Err(RkvError::decode(format!(
        "expected {}, got {}",
        expected,
        value.kind_name()
    )))
}

impl FromValue for Value {
    fn from_value(value: Value) -> RkvResult<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value.as_i64() {
            Some(number) => Ok(number),
            None => mismatch("64-bit integer", &value),
        }
    }
}

macro_rules! from_value_via_i64 {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> RkvResult<Self> {
                    let wide = i64::from_value(value)?;
                    <$ty>::try_from(wide).map_err(|_| {
                        RkvError::decode(format!(
                            "integer {} out of range for {}",
                            wide,
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

from_value_via_i64!(i32, u32, usize);

impl FromValue for u64 {
    fn from_value(value: Value) -> RkvResult<Self> {
        let parsed = match &value {
            Value::Int(number) => u64::try_from(*number).ok(),
            Value::Number(number) => number.as_u64(),
            _ => None,
        };
        match parsed {
            Some(number) => Ok(number),
            None => mismatch("unsigned 64-bit integer", &value),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value.as_f64() {
            Some(number) => Ok(number),
            None => mismatch("double", &value),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::Boolean(flag) => Ok(flag),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            other => mismatch("boolean", &other),
        }
    }
}

impl FromValue for Number {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::Number(number) => Ok(number),
            Value::Int(number) => Ok(Number::from(number)),
            other => mismatch("number", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::String(text) => Ok(text),
            other => mismatch("string", &other),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::Bytes(data) => Ok(data),
            Value::String(text) => Ok(Bytes::from(text)),
            other => mismatch("bytes", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> RkvResult<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("array", &other),
        }
    }
}

// =============================================================================
// Scalars
// =============================================================================

fn convert_scalar(reply: Reply, scalar: Scalar) -> RkvResult<Value> {
    match reply {
        Reply::Nil => return Ok(Value::Nil),
        Reply::Error(message) => return Err(RkvError::Server(message)),
        _ => {}
    }

    match scalar {
        Scalar::String => to_string(reply).map(Value::String),
        Scalar::Bytes => to_bytes(reply).map(Value::Bytes),
        Scalar::Int64 => to_i64(reply).map(Value::Int),
        Scalar::Double => to_f64(reply).map(Value::Double),
        Scalar::Boolean => to_bool(reply).map(Value::Boolean),
        Scalar::Number => to_number(reply).map(Value::Number),
    }
}

fn unexpected<T>(expected: &str, reply: &Reply) -> RkvResult<T> {
    Err(RkvError::decode(format!(
        "expected {}, got {}",
        expected,
        reply.kind_name()
    )))
}

fn utf8(data: Bytes) -> RkvResult<String> {
    String::from_utf8(data.to_vec()).map_err(|_| RkvError::decode("reply is not valid UTF-8"))
}

fn to_string(reply: Reply) -> RkvResult<String> {
    match reply {
        Reply::SimpleString(text) | Reply::BigNumber(text) => Ok(text),
        Reply::BulkString(data) | Reply::Verbatim { text: data, .. } => utf8(data),
        Reply::Integer(value) => Ok(value.to_string()),
        Reply::Double(value) => Ok(format_double(value)),
        other => unexpected("string", &other),
    }
}

fn to_bytes(reply: Reply) -> RkvResult<Bytes> {
    match reply {
        Reply::BulkString(data) | Reply::Verbatim { text: data, .. } => Ok(data),
        Reply::SimpleString(text) | Reply::BigNumber(text) => Ok(Bytes::from(text)),
        Reply::Integer(value) => Ok(Bytes::from(value.to_string())),
        Reply::Double(value) => Ok(Bytes::from(format_double(value))),
        other => unexpected("bytes", &other),
    }
}

fn to_i64(reply: Reply) -> RkvResult<i64> {
    match &reply {
        Reply::Integer(value) => Ok(*value),
        Reply::BigNumber(text) => text
            .parse()
            .map_err(|_| RkvError::decode(format!("big number {} does not fit in i64", text))),
        Reply::SimpleString(_) | Reply::BulkString(_) | Reply::Verbatim { .. } => {
            let text = reply.as_bytes().unwrap_or_default();
            std::str::from_utf8(text)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or_else(|| {
                    RkvError::decode(format!(
                        "'{}' is not a 64-bit integer",
                        String::from_utf8_lossy(text)
                    ))
                })
        }
        other => unexpected("integer", other),
    }
}

fn to_f64(reply: Reply) -> RkvResult<f64> {
    match &reply {
        Reply::Double(value) => Ok(*value),
        Reply::Integer(value) => Ok(*value as f64),
        Reply::BigNumber(text) => parse_double(text.as_bytes())
            .ok_or_else(|| RkvError::decode(format!("'{}' is not a double", text))),
        Reply::SimpleString(_) | Reply::BulkString(_) | Reply::Verbatim { .. } => {
            let text = reply.as_bytes().unwrap_or_default();
            parse_double(text).ok_or_else(|| {
                RkvError::decode(format!(
                    "'{}' is not a double",
                    String::from_utf8_lossy(text)
                ))
            })
        }
        other => unexpected("double", other),
    }
}

fn to_bool(reply: Reply) -> RkvResult<bool> {
    match &reply {
        Reply::Boolean(value) => Ok(*value),
        Reply::Integer(0) => Ok(false),
        Reply::Integer(1) => Ok(true),
        Reply::SimpleString(_) | Reply::BulkString(_) => match reply.as_bytes() {
            Some(b"t") => Ok(true),
            Some(b"f") => Ok(false),
            _ => Err(RkvError::decode(format!("'{}' is not a boolean token", reply))),
        },
        other => unexpected("boolean", other),
    }
}

fn to_number(reply: Reply) -> RkvResult<Number> {
    let text = match reply {
        Reply::Integer(value) => return Ok(Number::from(value)),
        Reply::Double(value) => format_double(value),
        Reply::BigNumber(text) | Reply::SimpleString(text) => text,
        Reply::BulkString(data) | Reply::Verbatim { text: data, .. } => utf8(data)?,
        other => return unexpected("number", &other),
    };
    Number::new(text.clone()).ok_or_else(|| RkvError::decode(format!("'{}' is not a number", text)))
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        value.to_string()
    }
}

// =============================================================================
// Containers
// =============================================================================

fn expect_sequence(reply: Reply, expected: &str) -> RkvResult<Vec<Reply>> {
    match reply {
        Reply::Array(items) | Reply::Set(items) | Reply::Push(items) => Ok(items),
        other => unexpected(expected, &other),
    }
}

/// Keys of maps and pair lists are text; they stay raw only for byte values.
fn key_scalar(scalar: Scalar) -> Scalar {
    if scalar == Scalar::Bytes {
        Scalar::Bytes
    } else {
        Scalar::String
    }
}

fn convert_pair(key: Reply, value: Reply, scalar: Scalar) -> RkvResult<(Value, Value)> {
    Ok((
        convert_scalar(key, key_scalar(scalar))?,
        convert_scalar(value, scalar)?,
    ))
}

/// Accepts a RESP3 map or a RESP2 flat `[k1, v1, k2, v2, ...]` array.
fn convert_map(reply: Reply, scalar: Scalar) -> RkvResult<Vec<(Value, Value)>> {
    match reply {
        Reply::Map(pairs) => pairs
            .into_iter()
            .map(|(key, value)| convert_pair(key, value, scalar))
            .collect(),
        Reply::Array(items) => convert_flat_pairs(items, scalar),
        other => unexpected("map", &other),
    }
}

/// Accepts `[[k, v], ...]`, a flat `[k, v, ...]` array, or a RESP3 map.
fn convert_pairs(reply: Reply, scalar: Scalar) -> RkvResult<Vec<(Value, Value)>> {
    let items = match reply {
        Reply::Map(_) => return convert_map(reply, scalar),
        Reply::Array(items) => items,
        other => return unexpected("key/value pair array", &other),
    };

    let nested = items.iter().all(|item| matches!(item, Reply::Array(_)));
    if !nested || items.is_empty() {
        return convert_flat_pairs(items, scalar);
    }

    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        let mut pair = expect_sequence(item, "key/value pair")?;
        if pair.len() != 2 {
            return Err(RkvError::decode(format!(
                "key/value pair has {} elements",
                pair.len()
            )));
        }
        let value = pair.pop().unwrap_or(Reply::Nil);
        let key = pair.pop().unwrap_or(Reply::Nil);
        pairs.push(convert_pair(key, value, scalar)?);
    }
    Ok(pairs)
}

fn convert_flat_pairs(items: Vec<Reply>, scalar: Scalar) -> RkvResult<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(RkvError::decode(format!(
            "flat key/value array has odd length {}",
            items.len()
        )));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push(convert_pair(key, value, scalar)?);
    }
    Ok(pairs)
}

/// Decodes `[[id, [f1, v1, ...]], ...]` stream entries.
fn convert_stream(reply: Reply, scalar: Scalar) -> RkvResult<Value> {
    let items = expect_sequence(reply, "stream entries")?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let mut parts = expect_sequence(item, "stream entry")?.into_iter();
        let (id, body) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(body), None) => (id, body),
            _ => return Err(RkvError::decode("stream entry must be [id, fields]")),
        };
        let id = match convert_scalar(id, Scalar::String)? {
            Value::String(id) => id,
            _ => return Err(RkvError::decode("stream entry id is nil")),
        };
        let fields = match body {
            Reply::Nil => None,
            other => Some(convert_map(other, scalar)?),
        };
        entries.push(StreamEntry { id, fields });
    }
    Ok(Value::Stream(entries))
}
