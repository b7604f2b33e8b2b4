//! # RESP2/RESP3 Encoding and Parsing
//!
//! Purpose: Encode commands as arrays of bulk strings and decode server
//! replies for either protocol revision, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `ReplyDecoder::decode` either consumes one whole
//!    frame from the buffer or consumes nothing and asks for more bytes, so the
//!    same decoder serves blocking sockets and tokio streams. Scan progress is
//!    kept across calls; a large reply costs one pass, not one per read.
//! 2. **Buffer Reuse**: Callers own the read buffer and the write buffer.
//! 3. **Binary-Safe**: Bulk strings are raw bytes; only the verb is ASCII.
//! 4. **Fail Fast**: Bad framing, unknown prefixes, and RESP3 types on a RESP2
//!    connection are protocol errors; the connection is out of sync afterwards.
//!
//! ## Wire Format
//!
//! ```text
//! request:  *<count>\r\n ( $<len>\r\n<bytes>\r\n ){count}
//!
//! replies:  +simple  -error  :integer  $bulk  *array          (RESP2 + RESP3)
//!           _null  ,double  #bool  (bignum  =verbatim  !bloberr
//!           %map(pairs)  ~set  >push                           (RESP3 only)
//! ```

use std::io::Read;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{RkvError, RkvResult};
use crate::reply::Reply;

/// Largest bulk payload accepted from the server (512 MiB).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest aggregate element count accepted from the server.
pub const MAX_AGGREGATE_LEN: i64 = 1 << 24;

/// Aggregates nested deeper than this are rejected.
pub const MAX_NESTING: usize = 64;

// Pre-allocation cap so a hostile count cannot reserve huge vectors up front.
const PREALLOC_CAP: usize = 1024;

/// Negotiated protocol revision of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::Resp2 => 2,
            ProtocolVersion::Resp3 => 3,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a command into the provided buffer.
pub fn encode_command(command: &Command, out: &mut Vec<u8>) {
    out.push(b'*');
    push_decimal(out, command.wire_len() as i64);
    out.extend_from_slice(b"\r\n");
    for part in command.wire_parts() {
        encode_bulk(part, out);
    }
}

/// Encodes a raw argument list (verb included) into the provided buffer.
pub fn encode_args(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_decimal(out, args.len() as i64);
    out.extend_from_slice(b"\r\n");
    for arg in args {
        encode_bulk(arg, out);
    }
}

fn encode_bulk(data: &[u8], out: &mut Vec<u8>) {
    out.push(b'$');
    push_decimal(out, data.len() as i64);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encodes a reply the way a server speaking `version` would.
///
/// On RESP2 the RESP3-only variants are downgraded the same way servers do it:
/// maps flatten into arrays, doubles and big numbers become bulk strings,
/// booleans become `:1`/`:0`, and nil becomes `$-1`.
pub fn encode_reply(reply: &Reply, version: ProtocolVersion, out: &mut Vec<u8>) {
    let resp3 = version == ProtocolVersion::Resp3;
    match reply {
        Reply::SimpleString(text) => push_line(out, b'+', text.as_bytes()),
        Reply::Error(text) => push_line(out, b'-', text.as_bytes()),
        Reply::Integer(value) => {
            out.push(b':');
            push_decimal(out, *value);
            out.extend_from_slice(b"\r\n");
        }
        Reply::Double(value) => {
            let text = format_double(*value);
            if resp3 {
                push_line(out, b',', text.as_bytes());
            } else {
                encode_bulk(text.as_bytes(), out);
            }
        }
        Reply::Boolean(value) => {
            if resp3 {
                push_line(out, b'#', if *value { b"t" } else { b"f" });
            } else {
                push_line(out, b':', if *value { b"1" } else { b"0" });
            }
        }
        Reply::BigNumber(text) => {
            if resp3 {
                push_line(out, b'(', text.as_bytes());
            } else {
                encode_bulk(text.as_bytes(), out);
            }
        }
        Reply::BulkString(data) => encode_bulk(data, out),
        Reply::Verbatim { format, text } => {
            if resp3 {
                out.push(b'=');
                push_decimal(out, (text.len() + 4) as i64);
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(format.as_bytes());
                out.push(b':');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            } else {
                encode_bulk(text, out);
            }
        }
        Reply::Nil => {
            if resp3 {
                out.extend_from_slice(b"_\r\n");
            } else {
                out.extend_from_slice(b"$-1\r\n");
            }
        }
        Reply::Array(items) => encode_aggregate(b'*', items, version, out),
        Reply::Set(items) => {
            encode_aggregate(if resp3 { b'~' } else { b'*' }, items, version, out)
        }
        Reply::Push(items) => {
            encode_aggregate(if resp3 { b'>' } else { b'*' }, items, version, out)
        }
        Reply::Map(pairs) => {
            if resp3 {
                out.push(b'%');
                push_decimal(out, pairs.len() as i64);
            } else {
                out.push(b'*');
                push_decimal(out, (pairs.len() * 2) as i64);
            }
            out.extend_from_slice(b"\r\n");
            for (key, value) in pairs {
                encode_reply(key, version, out);
                encode_reply(value, version, out);
            }
        }
    }
}

fn encode_aggregate(prefix: u8, items: &[Reply], version: ProtocolVersion, out: &mut Vec<u8>) {
    out.push(prefix);
    push_decimal(out, items.len() as i64);
    out.extend_from_slice(b"\r\n");
    for item in items {
        encode_reply(item, version, out);
    }
}

fn push_line(out: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
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

fn push_decimal(out: &mut Vec<u8>, value: i64) {
    if value < 0 {
        out.push(b'-');
    }
    let mut value = value.unsigned_abs();
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut idx = buf.len();
    loop {
        idx -= 1;
        buf[idx] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[idx..]);
}

// =============================================================================
// Decoding
// =============================================================================

/// One decoded top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A reply paired with a request, in FIFO order.
    Reply(Reply),
    /// An unsolicited RESP3 push (for example a cache invalidation).
    Push(Vec<Reply>),
}

/// Incremental decoder bound to one connection's protocol version.
///
/// A partial frame is scanned once: the decoder remembers how far the
/// current frame has been validated and which aggregates are still open, so
/// each new read only walks the bytes that just arrived. The `Reply` tree is
/// built in a single pass once the frame is complete.
#[derive(Debug, Clone, Default)]
pub struct ReplyDecoder {
    version: ProtocolVersion,
    scan: FrameScan,
}

/// Progress through the frame at the front of the buffer.
#[derive(Debug, Clone, Default)]
struct FrameScan {
    /// Offset of the first value not yet known to be complete.
    pos: usize,
    /// Children still expected by each open aggregate, innermost last.
    open: Vec<usize>,
}

impl ReplyDecoder {
    pub fn new(version: ProtocolVersion) -> Self {
        ReplyDecoder {
            version,
            scan: FrameScan::default(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switches the accepted type set, used once by the handshake.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
        self.reset();
    }

    /// Forgets any partially scanned frame.
    ///
    /// Call this when the buffer is replaced or cleared by the owner.
    pub fn reset(&mut self) {
        self.scan.pos = 0;
        self.scan.open.clear();
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when it does not yet hold
    /// a complete frame. Bulk payloads of the returned frame share the
    /// buffer's allocation instead of being copied.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RkvResult<Option<Frame>> {
        let len = match self.scan_frame(buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.reset();
                return Err(err.into_error());
            }
        };
        self.reset();

        let frame = buf.split_to(len).freeze();
        let mut cursor = Cursor {
            data: &frame,
            pos: 0,
            version: self.version,
            source: Some(&frame),
        };
        let reply = cursor.parse_value(0).map_err(ParseError::into_error)?;
        if cursor.pos != len {
            return Err(RkvError::protocol("frame length disagrees with its scan"));
        }
        Ok(Some(match reply {
            Reply::Push(items) => Frame::Push(items),
            other => Frame::Reply(other),
        }))
    }

    /// Decodes one reply from `data`, returning it with the consumed length.
    ///
    /// One-shot: no scan state is kept between calls.
    pub fn decode_slice(&self, data: &[u8]) -> RkvResult<Option<(Reply, usize)>> {
        let mut cursor = Cursor {
            data,
            pos: 0,
            version: self.version,
            source: None,
        };
        match cursor.parse_value(0) {
            Ok(reply) => Ok(Some((reply, cursor.pos))),
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(message)) => Err(RkvError::protocol(message)),
        }
    }

    /// Walks value headers and lengths without building replies.
    ///
    /// Returns the frame length once the outermost value is complete.
    fn scan_frame(&mut self, data: &[u8]) -> ParseResult<Option<usize>> {
        let version = self.version;
        let scan = &mut self.scan;
        loop {
            let start = scan.pos;
            let prefix = match data.get(start) {
                Some(&byte) => byte,
                None => return Ok(None),
            };
            if version != ProtocolVersion::Resp3 && is_resp3_prefix(prefix) {
                return invalid(format!(
                    "RESP3 type '{}' on a RESP2 connection",
                    prefix as char
                ));
            }
            if !is_known_prefix(prefix) {
                return invalid(format!("unknown type prefix 0x{:02x}", prefix));
            }
            let (header, line_end) = match find_line(data, start + 1)? {
                Some(found) => found,
                None => return Ok(None),
            };

            let end = match prefix {
                b'+' | b'-' | b':' | b'_' | b',' | b'#' | b'(' => line_end,
                b'$' | b'=' | b'!' => {
                    let len = parse_i64(header)?;
                    if len == -1 {
                        line_end
                    } else if !(0..=MAX_BULK_LEN).contains(&len) {
                        return invalid(format!("invalid bulk length {}", len));
                    } else {
                        let need = line_end + len as usize + 2;
                        if data.len() < need {
                            return Ok(None);
                        }
                        need
                    }
                }
                b'*' | b'~' | b'>' | b'%' => {
                    let count = parse_i64(header)?;
                    if count == -1 || count == 0 {
                        line_end
                    } else if !(0..=MAX_AGGREGATE_LEN).contains(&count) {
                        return invalid(format!("invalid aggregate size {}", count));
                    } else {
                        if scan.open.len() >= MAX_NESTING {
                            return invalid("aggregate nesting too deep");
                        }
                        let children = if prefix == b'%' { count * 2 } else { count };
                        scan.open.push(children as usize);
                        scan.pos = line_end;
                        continue;
                    }
                }
                other => return invalid(format!("unknown type prefix 0x{:02x}", other)),
            };

            scan.pos = end;
            // A finished value may finish its parents too.
            loop {
                match scan.open.last_mut() {
                    None => return Ok(Some(end)),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        scan.open.pop();
                    }
                }
            }
        }
    }
}

fn is_known_prefix(prefix: u8) -> bool {
    matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*') || is_resp3_prefix(prefix)
}

fn is_resp3_prefix(prefix: u8) -> bool {
    matches!(
        prefix,
        b'_' | b',' | b'#' | b'(' | b'=' | b'!' | b'%' | b'~' | b'>'
    )
}

/// Finds the CRLF-terminated line starting at `from`.
///
/// Returns the line without its terminator and the offset just past it.
fn find_line(data: &[u8], from: usize) -> ParseResult<Option<(&[u8], usize)>> {
    let rest = match data.get(from..) {
        Some(rest) => rest,
        None => return Ok(None),
    };
    match rest.iter().position(|&b| b == b'\n') {
        Some(0) => invalid("line not terminated by CRLF"),
        Some(idx) if rest[idx - 1] != b'\r' => invalid("line not terminated by CRLF"),
        Some(idx) => Ok(Some((&rest[..idx - 1], from + idx + 1))),
        None => Ok(None),
    }
}

/// Reads one frame from a blocking reader, pulling more bytes as needed.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub fn read_frame<R: Read>(
    reader: &mut R,
    buf: &mut BytesMut,
    decoder: &mut ReplyDecoder,
) -> RkvResult<Option<Frame>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(Some(frame));
        }
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RkvError::protocol("stream closed inside a frame"));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

enum ParseError {
    Incomplete,
    Invalid(String),
}

impl ParseError {
    fn into_error(self) -> RkvError {
        match self {
            ParseError::Incomplete => RkvError::protocol("frame ended early"),
            ParseError::Invalid(message) => RkvError::protocol(message),
        }
    }
}

type ParseResult<T> = Result<T, ParseError>;

fn invalid<T>(message: impl Into<String>) -> ParseResult<T> {
    Err(ParseError::Invalid(message.into()))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    version: ProtocolVersion,
    /// Owner of `data`, when payloads can be sliced out of it.
    source: Option<&'a Bytes>,
}

impl<'a> Cursor<'a> {
    fn payload(&self, data: &'a [u8]) -> Bytes {
        match self.source {
            Some(source) => source.slice_ref(data),
            None => Bytes::copy_from_slice(data),
        }
    }

    fn parse_value(&mut self, depth: usize) -> ParseResult<Reply> {
        if depth > MAX_NESTING {
            return invalid("aggregate nesting too deep");
        }

        let prefix = self.read_u8()?;
        match prefix {
            b'+' => Ok(Reply::SimpleString(lossy(self.read_line()?))),
            b'-' => Ok(Reply::Error(lossy(self.read_line()?))),
            b':' => Ok(Reply::Integer(parse_i64(self.read_line()?)?)),
            b'$' => {
                let len = parse_i64(self.read_line()?)?;
                match self.read_blob(len)? {
                    Some(data) => Ok(Reply::BulkString(self.payload(data))),
                    None => Ok(Reply::Nil),
                }
            }
            b'*' => {
                let count = parse_i64(self.read_line()?)?;
                match self.read_items(count, depth)? {
                    Some(items) => Ok(Reply::Array(items)),
                    None => Ok(Reply::Nil),
                }
            }
            _ if is_resp3_prefix(prefix) => {
                if self.version != ProtocolVersion::Resp3 {
                    return invalid(format!(
                        "RESP3 type '{}' on a RESP2 connection",
                        prefix as char
                    ));
                }
                self.parse_resp3(prefix, depth)
            }
            other => invalid(format!("unknown type prefix 0x{:02x}", other)),
        }
    }

    fn parse_resp3(&mut self, prefix: u8, depth: usize) -> ParseResult<Reply> {
        match prefix {
            b'_' => {
                if !self.read_line()?.is_empty() {
                    return invalid("null with payload");
                }
                Ok(Reply::Nil)
            }
            b',' => {
                let line = self.read_line()?;
                match parse_double(line) {
                    Some(value) => Ok(Reply::Double(value)),
                    None => invalid(format!("invalid double '{}'", lossy(line))),
                }
            }
            b'#' => match self.read_line()? {
                b"t" => Ok(Reply::Boolean(true)),
                b"f" => Ok(Reply::Boolean(false)),
                other => invalid(format!("invalid boolean '{}'", lossy(other))),
            },
            b'(' => {
                let line = self.read_line()?;
                if !is_integer_text(line) {
                    return invalid(format!("invalid big number '{}'", lossy(line)));
                }
                Ok(Reply::BigNumber(lossy(line)))
            }
            b'=' => {
                let len = parse_i64(self.read_line()?)?;
                let data = match self.read_blob(len)? {
                    Some(data) => data,
                    None => return invalid("null verbatim string"),
                };
                if data.len() < 4 || data[3] != b':' {
                    return invalid("verbatim string without format tag");
                }
                Ok(Reply::Verbatim {
                    format: lossy(&data[..3]),
                    text: self.payload(&data[4..]),
                })
            }
            b'!' => {
                let len = parse_i64(self.read_line()?)?;
                match self.read_blob(len)? {
                    Some(data) => Ok(Reply::Error(lossy(data))),
                    None => invalid("null blob error"),
                }
            }
            b'%' => {
                let count = parse_i64(self.read_line()?)?;
                if count < 0 || count > MAX_AGGREGATE_LEN {
                    return invalid(format!("invalid map size {}", count));
                }
                let count = count as usize;
                let mut pairs = Vec::with_capacity(count.min(PREALLOC_CAP));
                for _ in 0..count {
                    let key = self.parse_value(depth + 1)?;
                    let value = self.parse_value(depth + 1)?;
                    pairs.push((key, value));
                }
                Ok(Reply::Map(pairs))
            }
            b'~' | b'>' => {
                let count = parse_i64(self.read_line()?)?;
                let items = match self.read_items(count, depth)? {
                    Some(items) => items,
                    None => return invalid("null set or push"),
                };
                if prefix == b'~' {
                    Ok(Reply::Set(items))
                } else {
                    Ok(Reply::Push(items))
                }
            }
            other => invalid(format!("unknown type prefix 0x{:02x}", other)),
        }
    }

    /// Reads `count` nested values; a count of -1 is the null aggregate.
    fn read_items(&mut self, count: i64, depth: usize) -> ParseResult<Option<Vec<Reply>>> {
        if count == -1 {
            return Ok(None);
        }
        if count < 0 || count > MAX_AGGREGATE_LEN {
            return invalid(format!("invalid aggregate size {}", count));
        }
        let count = count as usize;
        let mut items = Vec::with_capacity(count.min(PREALLOC_CAP));
        for _ in 0..count {
            items.push(self.parse_value(depth + 1)?);
        }
        Ok(Some(items))
    }

    /// Reads a length-prefixed payload and its terminator; -1 is null.
    fn read_blob(&mut self, len: i64) -> ParseResult<Option<&'a [u8]>> {
        if len == -1 {
            return Ok(None);
        }
        if len < 0 || len > MAX_BULK_LEN {
            return invalid(format!("invalid bulk length {}", len));
        }
        let len = len as usize;
        let data = self.read_exact(len)?;
        if self.read_exact(2)? != b"\r\n" {
            return invalid("bulk payload not terminated by CRLF");
        }
        Ok(Some(data))
    }

    fn read_u8(&mut self) -> ParseResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(ParseError::Incomplete)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_exact(&mut self, len: usize) -> ParseResult<&'a [u8]> {
        let data = self.data;
        let end = self.pos.checked_add(len).ok_or(ParseError::Incomplete)?;
        if end > data.len() {
            return Err(ParseError::Incomplete);
        }
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads up to the next CRLF and returns the line without it.
    fn read_line(&mut self) -> ParseResult<&'a [u8]> {
        let data = self.data;
        let rest = &data[self.pos..];
        let newline = match rest.iter().position(|&b| b == b'\n') {
            Some(idx) => idx,
            None => return Err(ParseError::Incomplete),
        };
        if newline == 0 || rest[newline - 1] != b'\r' {
            return invalid("line not terminated by CRLF");
        }
        self.pos += newline + 1;
        Ok(&rest[..newline - 1])
    }
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> ParseResult<i64> {
    let text = match std::str::from_utf8(data) {
        Ok(text) if is_integer_text(data) => text,
        _ => return invalid(format!("invalid integer '{}'", lossy(data))),
    };
    match text.parse::<i64>() {
        Ok(value) => Ok(value),
        Err(_) => invalid(format!("integer out of range '{}'", text)),
    }
}

/// Returns true for an optional sign followed by at least one ASCII digit.
pub(crate) fn is_integer_text(data: &[u8]) -> bool {
    let digits = match data.first() {
        Some(b'-') | Some(b'+') => &data[1..],
        _ => data,
    };
    !digits.is_empty() && digits.iter().all(u8::is_ascii_digit)
}

/// Parses a double token, accepting `inf`, `+inf`, `-inf` and `nan` in any case.
pub fn parse_double(data: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(data).ok()?;
    let lowered = text.to_ascii_lowercase();
    match lowered.as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => return Some(f64::INFINITY),
        "-inf" | "-infinity" => return Some(f64::NEG_INFINITY),
        "nan" | "+nan" | "-nan" => return Some(f64::NAN),
        _ => {}
    }
    let well_formed = !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'));
    if !well_formed {
        return None;
    }
    text.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(version: ProtocolVersion, input: &[u8]) -> RkvResult<Option<Frame>> {
        let mut buf = BytesMut::from(input);
        ReplyDecoder::new(version).decode(&mut buf)
    }

    fn reply(version: ProtocolVersion, input: &[u8]) -> Reply {
        match decode_one(version, input).unwrap() {
            Some(Frame::Reply(reply)) => reply,
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn encodes_set_command() {
        let mut buf = Vec::new();
        encode_command(&Command::new("SET").arg("foo").arg("bar"), &mut buf);
        assert_eq!(&buf, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn encodes_binary_and_empty_args() {
        let mut buf = Vec::new();
        encode_args(&[b"ECHO", b"\r\n\x00", b""], &mut buf);
        assert_eq!(&buf, b"*3\r\n$4\r\nECHO\r\n$3\r\n\r\n\x00\r\n$0\r\n\r\n");
    }

    #[test]
    fn parses_resp2_scalars() {
        let v2 = ProtocolVersion::Resp2;
        assert_eq!(reply(v2, b"+OK\r\n"), Reply::simple("OK"));
        assert_eq!(reply(v2, b"-ERR bad\r\n"), Reply::error("ERR bad"));
        assert_eq!(reply(v2, b":-42\r\n"), Reply::Integer(-42));
        assert_eq!(reply(v2, b"$5\r\nhello\r\n"), Reply::bulk("hello"));
        assert_eq!(reply(v2, b"$0\r\n\r\n"), Reply::bulk(""));
        assert_eq!(reply(v2, b"$-1\r\n"), Reply::Nil);
        assert_eq!(reply(v2, b"*-1\r\n"), Reply::Nil);
    }

    #[test]
    fn parses_nested_array() {
        let input = b"*2\r\n:1\r\n*2\r\n$1\r\na\r\n$-1\r\n";
        let expected = Reply::Array(vec![
            Reply::Integer(1),
            Reply::Array(vec![Reply::bulk("a"), Reply::Nil]),
        ]);
        assert_eq!(reply(ProtocolVersion::Resp2, input), expected);
    }

    #[test]
    fn parses_resp3_types() {
        let v3 = ProtocolVersion::Resp3;
        assert_eq!(reply(v3, b"_\r\n"), Reply::Nil);
        assert_eq!(reply(v3, b"#t\r\n"), Reply::Boolean(true));
        assert_eq!(reply(v3, b",3.5\r\n"), Reply::Double(3.5));
        assert_eq!(reply(v3, b"(3492890328409238509324850943850943825024385\r\n"),
            Reply::BigNumber("3492890328409238509324850943850943825024385".into()));
        assert_eq!(
            reply(v3, b"=15\r\ntxt:Some string\r\n"),
            Reply::Verbatim { format: "txt".into(), text: Bytes::from_static(b"Some string") }
        );
        assert_eq!(reply(v3, b"!9\r\nERR oops!\r\n"), Reply::error("ERR oops!"));
        assert_eq!(
            reply(v3, b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n"),
            Reply::Map(vec![
                (Reply::simple("a"), Reply::Integer(1)),
                (Reply::simple("b"), Reply::Integer(2)),
            ])
        );
        assert_eq!(reply(v3, b"~1\r\n:7\r\n"), Reply::Set(vec![Reply::Integer(7)]));
    }

    #[test]
    fn double_special_values() {
        let v3 = ProtocolVersion::Resp3;
        assert_eq!(reply(v3, b",inf\r\n"), Reply::Double(f64::INFINITY));
        assert_eq!(reply(v3, b",-inf\r\n"), Reply::Double(f64::NEG_INFINITY));
        match reply(v3, b",nan\r\n") {
            Reply::Double(value) => assert!(value.is_nan()),
            other => panic!("expected double, got {:?}", other),
        }
        assert_eq!(parse_double(b"-INF"), Some(f64::NEG_INFINITY));
        assert!(parse_double(b"NaN").unwrap().is_nan());
        assert_eq!(parse_double(b"1e3"), Some(1000.0));
        assert_eq!(parse_double(b"abc"), None);
    }

    #[test]
    fn push_is_separated_from_replies() {
        let input = b">2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n+OK\r\n";
        let mut buf = BytesMut::from(&input[..]);
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp3);
        match decoder.decode(&mut buf).unwrap() {
            Some(Frame::Push(items)) => {
                assert_eq!(items[0], Reply::bulk("invalidate"));
            }
            other => panic!("expected push, got {:?}", other),
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Frame::Reply(Reply::simple("OK"))));
        assert!(buf.is_empty());
    }

    #[test]
    fn resp3_types_rejected_on_resp2() {
        for input in [&b"_\r\n"[..], b"#t\r\n", b",1.0\r\n", b"%0\r\n", b">0\r\n"] {
            match decode_one(ProtocolVersion::Resp2, input) {
                Err(RkvError::Protocol(_)) => {}
                other => panic!("expected protocol error, got {:?}", other),
            }
        }
    }

    #[test]
    fn incomplete_input_consumes_nothing() {
        for partial in [&b"$5\r\nhel"[..], b"*2\r\n:1\r\n", b"+OK", b""] {
            let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
            let mut buf = BytesMut::from(partial);
            assert_eq!(decoder.decode(&mut buf).unwrap(), None);
            assert_eq!(&buf[..], partial);
        }
    }

    #[test]
    fn frame_split_at_every_byte() {
        let input = b"*3\r\n$3\r\nfoo\r\n*2\r\n:1\r\n$-1\r\n+OK\r\n:9\r\n";
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in input.iter() {
            buf.extend_from_slice(&[*byte]);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame::Reply(Reply::Array(vec![
                    Reply::bulk("foo"),
                    Reply::Array(vec![Reply::Integer(1), Reply::Nil]),
                    Reply::simple("OK"),
                ])),
                Frame::Reply(Reply::Integer(9)),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn large_reply_in_small_chunks_decodes_in_one_pass() {
        const ELEMENTS: usize = 150_000;
        let items: Vec<Reply> = (0..ELEMENTS as i64).map(Reply::Integer).collect();
        let mut wire = Vec::new();
        encode_reply(&Reply::Array(items), ProtocolVersion::Resp2, &mut wire);

        let started = std::time::Instant::now();
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(4096) {
            assert!(decoded.is_none());
            buf.extend_from_slice(chunk);
            decoded = decoder.decode(&mut buf).unwrap();
        }
        let elapsed = started.elapsed();

        match decoded {
            Some(Frame::Reply(Reply::Array(items))) => {
                assert_eq!(items.len(), ELEMENTS);
                assert_eq!(items[ELEMENTS - 1], Reply::Integer(ELEMENTS as i64 - 1));
            }
            other => panic!("expected array, got {:?}", other.map(|_| "other frame")),
        }
        assert!(buf.is_empty());
        assert!(elapsed < std::time::Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[test]
    fn empty_and_full_bulk_payloads_in_one_frame() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nabc\r\n$0\r\n\r\n"[..]);
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
        let frame = decoder.decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Some(Frame::Reply(Reply::Array(vec![Reply::bulk("abc"), Reply::bulk("")])))
        );
    }

    #[test]
    fn scan_rejects_bad_input_before_the_frame_completes() {
        let mut decoder = ReplyDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::from(&b"*3\r\n:1\r\n?"[..]);
        match decoder.decode(&mut buf) {
            Err(RkvError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
        // State is cleared after the error.
        let mut fresh = BytesMut::from(&b"+OK\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut fresh).unwrap(),
            Some(Frame::Reply(Reply::simple("OK")))
        );
    }

    #[test]
    fn malformed_input_is_protocol_error() {
        for input in [&b"?x\r\n"[..], b":12a\r\n", b"$3\r\nabcd\r\n", b"+OK\n", b"$-5\r\n"] {
            match decode_one(ProtocolVersion::Resp2, input) {
                Err(RkvError::Protocol(_)) => {}
                other => panic!("expected protocol error for {:?}, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn resp2_encoding_downgrades_resp3_values() {
        let mut buf = Vec::new();
        let map = Reply::Map(vec![(Reply::bulk("k"), Reply::Boolean(true))]);
        encode_reply(&map, ProtocolVersion::Resp2, &mut buf);
        assert_eq!(&buf, b"*2\r\n$1\r\nk\r\n:1\r\n");

        buf.clear();
        encode_reply(&Reply::Nil, ProtocolVersion::Resp2, &mut buf);
        assert_eq!(&buf, b"$-1\r\n");
    }

    #[test]
    fn resp3_encoding_roundtrips() {
        let original = Reply::Push(vec![
            Reply::bulk("invalidate"),
            Reply::Array(vec![Reply::bulk("a"), Reply::bulk("b")]),
            Reply::Double(f64::NEG_INFINITY),
            Reply::Verbatim { format: "txt".into(), text: Bytes::from_static(b"x") },
        ]);
        let mut buf = Vec::new();
        encode_reply(&original, ProtocolVersion::Resp3, &mut buf);
        let (decoded, used) = ReplyDecoder::new(ProtocolVersion::Resp3)
            .decode_slice(&buf)
            .unwrap()
            .unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, original);
    }
}
