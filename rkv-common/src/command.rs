//! # Command Descriptor
//!
//! A verb, its binary-safe arguments, the result type the caller expects, and
//! a routing hint. Built once with the consuming builder methods and then only
//! read.

use bytes::Bytes;

use crate::result_type::ResultType;

/// One binary-safe command argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Arg(Bytes);

impl Arg {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg(Bytes::from(value))
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg(Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(value: &[u8; N]) -> Self {
        Arg(Bytes::copy_from_slice(value))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg(Bytes::from(value))
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Arg::from(value.as_str())
    }
}

macro_rules! arg_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg(Bytes::from(value.to_string()))
                }
            }
        )*
    };
}

arg_from_display!(i32, i64, u32, u64, usize);

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        let text = if value.is_infinite() {
            if value > 0.0 { "+inf".to_string() } else { "-inf".to_string() }
        } else {
            value.to_string()
        };
        Arg(Bytes::from(text))
    }
}

/// Which role of server should answer a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Route {
    /// Writes and reads that must observe the latest state.
    #[default]
    Master,
    /// Reads that may be served by a replica when one is configured.
    Replica,
}

/// Immutable command descriptor handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: String,
    args: Vec<Arg>,
    result_type: ResultType,
    route: Route,
}

impl Command {
    /// Starts a command for `verb` with no arguments.
    ///
    /// Multi-word verbs (`CLIENT TRACKING`) are split on whitespace when
    /// encoded, so each word is sent as its own bulk string.
    pub fn new(verb: impl Into<String>) -> Self {
        Command {
            verb: verb.into(),
            args: Vec::new(),
            result_type: ResultType::NONE,
            route: Route::Master,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument from `args`.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Declares the result shape the caller expects.
    pub fn returns(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    /// Marks the command as a read that replicas may serve.
    pub fn on_replica(mut self) -> Self {
        self.route = Route::Replica;
        self
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// Number of bulk strings this command occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.verb.split_ascii_whitespace().count() + self.args.len()
    }

    /// Iterates every wire token (verb words first, then arguments).
    pub fn wire_parts(&self) -> impl Iterator<Item = &[u8]> {
        self.verb
            .split_ascii_whitespace()
            .map(str::as_bytes)
            .chain(self.args.iter().map(Arg::as_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args() {
        let cmd = Command::new("SET")
            .arg("foo")
            .arg(b"bar")
            .arg(10i64)
            .returns(ResultType::STRING);
        let parts: Vec<&[u8]> = cmd.wire_parts().collect();
        assert_eq!(parts, vec![&b"SET"[..], b"foo", b"bar", b"10"]);
        assert_eq!(cmd.result_type(), ResultType::STRING);
        assert_eq!(cmd.route(), Route::Master);
    }

    #[test]
    fn multi_word_verb_splits() {
        let cmd = Command::new("CLIENT TRACKING").arg("ON");
        assert_eq!(cmd.wire_len(), 3);
        let parts: Vec<&[u8]> = cmd.wire_parts().collect();
        assert_eq!(parts, vec![&b"CLIENT"[..], b"TRACKING", b"ON"]);
    }

    #[test]
    fn infinite_scores_use_wire_tokens() {
        assert_eq!(Arg::from(f64::INFINITY).as_bytes(), b"+inf");
        assert_eq!(Arg::from(f64::NEG_INFINITY).as_bytes(), b"-inf");
        assert_eq!(Arg::from(1.5f64).as_bytes(), b"1.5");
    }
}
