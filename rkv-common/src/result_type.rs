//! # Result Type Descriptors
//!
//! Purpose: Describe the shape a caller expects back from a command as a set
//! of composable flags, and derive one decoding strategy from that set.
//!
//! ## Design Principles
//! 1. **Composable Flags**: `ResultType::ARRAY | ResultType::STRING` reads as
//!    "array of strings"; containers and element scalars are separate bits.
//! 2. **One Strategy Per Combination**: `shape()` maps every supported
//!    combination to exactly one `Shape`; anything else is a programming error
//!    reported as `RkvError::UnsupportedResultType`, never a panic.
//!
//! ## Supported Combinations
//!
//! ```text
//! <scalar>                          -> Shape::Scalar
//! ARRAY | <scalar>                  -> Shape::Array
//! MAP | <scalar>                    -> Shape::Map            (values typed, keys text)
//! KEY_VALUE_PAIR_ARRAY | <scalar>   -> Shape::KeyValuePairs  (values typed, keys text)
//! ARRAY | MAP | <scalar>            -> Shape::ArrayOfMaps
//! STREAM [| STRING | BYTES]         -> Shape::Stream         (field values; STRING if omitted)
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::error::{RkvError, RkvResult};

/// Bit-flag set describing the expected reply shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultType(u32);

impl ResultType {
    pub const NONE: ResultType = ResultType(0);

    // Element scalars.
    pub const STRING: ResultType = ResultType(1 << 0);
    pub const BYTES: ResultType = ResultType(1 << 1);
    pub const INT64: ResultType = ResultType(1 << 2);
    pub const DOUBLE: ResultType = ResultType(1 << 3);
    pub const BOOLEAN: ResultType = ResultType(1 << 4);
    pub const NUMBER: ResultType = ResultType(1 << 5);

    // Containers.
    pub const ARRAY: ResultType = ResultType(1 << 8);
    pub const MAP: ResultType = ResultType(1 << 9);
    pub const STREAM: ResultType = ResultType(1 << 10);
    pub const KEY_VALUE_PAIR_ARRAY: ResultType = ResultType(1 << 11);

    const SCALAR_MASK: u32 = 0x00ff;
    const CONTAINER_MASK: u32 = 0x0f00;

    const NAMES: [(ResultType, &'static str); 10] = [
        (ResultType::ARRAY, "Array"),
        (ResultType::MAP, "Map"),
        (ResultType::STREAM, "Stream"),
        (ResultType::KEY_VALUE_PAIR_ARRAY, "KeyValuePairArray"),
        (ResultType::STRING, "String"),
        (ResultType::BYTES, "Bytes"),
        (ResultType::INT64, "Int64"),
        (ResultType::DOUBLE, "Double"),
        (ResultType::BOOLEAN, "Boolean"),
        (ResultType::NUMBER, "Number"),
    ];

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a descriptor from raw bits, rejecting unknown bits.
    pub const fn from_bits(bits: u32) -> Option<ResultType> {
        if bits & !(Self::SCALAR_MASK | Self::CONTAINER_MASK) != 0 {
            return None;
        }
        Some(ResultType(bits))
    }

    pub const fn union(self, other: ResultType) -> ResultType {
        ResultType(self.0 | other.0)
    }

    /// Returns true when every bit of `other` is set in `self`.
    pub const fn contains(self, other: ResultType) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Derives the decoding strategy for this flag combination.
    pub fn shape(self) -> RkvResult<Shape> {
        let unsupported = || RkvError::UnsupportedResultType(self);

        let scalar_bits = self.0 & Self::SCALAR_MASK;
        let container_bits = self.0 & Self::CONTAINER_MASK;

        let scalar = match scalar_bits {
            0 => None,
            _ if scalar_bits.count_ones() != 1 => return Err(unsupported()),
            _ => Some(Scalar::from_bit(scalar_bits).ok_or_else(unsupported)?),
        };

        let stream = Self::STREAM.0;
        let array = Self::ARRAY.0;
        let map = Self::MAP.0;
        let pairs = Self::KEY_VALUE_PAIR_ARRAY.0;

        if container_bits == stream {
            return match scalar {
                None | Some(Scalar::String) => Ok(Shape::Stream(Scalar::String)),
                Some(Scalar::Bytes) => Ok(Shape::Stream(Scalar::Bytes)),
                Some(_) => Err(unsupported()),
            };
        }

        let scalar = scalar.ok_or_else(unsupported)?;
        match container_bits {
            0 => Ok(Shape::Scalar(scalar)),
            bits if bits == array => Ok(Shape::Array(scalar)),
            bits if bits == map => Ok(Shape::Map(scalar)),
            bits if bits == pairs => Ok(Shape::KeyValuePairs(scalar)),
            bits if bits == array | map => Ok(Shape::ArrayOfMaps(scalar)),
            _ => Err(unsupported()),
        }
    }
}

impl BitOr for ResultType {
    type Output = ResultType;

    fn bitor(self, rhs: ResultType) -> ResultType {
        self.union(rhs)
    }
}

impl BitOrAssign for ResultType {
    fn bitor_assign(&mut self, rhs: ResultType) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ResultType {
    type Output = ResultType;

    fn bitand(self, rhs: ResultType) -> ResultType {
        ResultType(self.0 & rhs.0)
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultType({})", self)
    }
}

/// Element scalar decoded at the leaves of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    String,
    Bytes,
    Int64,
    Double,
    Boolean,
    Number,
}

impl Scalar {
    fn from_bit(bit: u32) -> Option<Scalar> {
        let scalar = match ResultType(bit) {
            ResultType::STRING => Scalar::String,
            ResultType::BYTES => Scalar::Bytes,
            ResultType::INT64 => Scalar::Int64,
            ResultType::DOUBLE => Scalar::Double,
            ResultType::BOOLEAN => Scalar::Boolean,
            ResultType::NUMBER => Scalar::Number,
            _ => return None,
        };
        Some(scalar)
    }
}

/// Decoding strategy derived from a [`ResultType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar(Scalar),
    Array(Scalar),
    Map(Scalar),
    KeyValuePairs(Scalar),
    ArrayOfMaps(Scalar),
    Stream(Scalar),
}
