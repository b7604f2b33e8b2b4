//! # rkv-common
//!
//! Purpose: Wire-level building blocks shared by the client engine and the
//! test server: the RESP2/RESP3 codec, command descriptors, result type
//! flags, and the reply-to-value converter.
//!
//! ## Design Principles
//! 1. **No IO Policy**: decoding works on buffers; sockets, timeouts and
//!    pooling live in `rkv-client`.
//! 2. **Binary Safety**: arguments and bulk payloads are `Bytes`, never
//!    assumed to be UTF-8.
//! 3. **Total Conversion**: every reply/result-type pair ends in a value or an
//!    error.

pub mod codec;
pub mod command;
pub mod convert;
pub mod error;
pub mod reply;
pub mod result_type;
pub mod value;

pub use codec::{
    encode_args, encode_command, encode_reply, parse_double, read_frame, Frame, ProtocolVersion,
    ReplyDecoder,
};
pub use command::{Arg, Command, Route};
pub use convert::{convert, FromValue};
pub use error::{ErrorKind, RkvError, RkvResult};
pub use reply::Reply;
pub use result_type::{ResultType, Scalar, Shape};
pub use value::{Number, StreamEntry, Value};
