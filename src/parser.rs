//! Streaming, restartable RESP2/RESP3 decoder.
//!
//! The decoder keeps a parse stack whose frames correspond to
//! in-progress aggregates (arrays, maps, sets, attributes, pushes).
//! Scalar tokens and aggregate headers are consumed from the front of
//! the buffer as they complete and folded into the innermost frame;
//! when the bytes run out mid-aggregate the stack persists, so the
//! next call resumes with the missing elements instead of re-parsing
//! the ones already seen.

use crate::types::{
    ErrorKind, PushKind, RedisError, RedisResult, ServerError, Value, VerbatimFormat,
};
use bytes::{Buf, BytesMut};
use num_bigint::BigInt;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Array,
    Map,
    Set,
    Push,
    Attribute,
}

/// One in-progress aggregate on the parse stack.
#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    remaining: usize,
    items: Vec<Value>,
}

impl Frame {
    fn new(kind: FrameKind, remaining: usize) -> Frame {
        Frame {
            kind,
            remaining,
            items: Vec::with_capacity(remaining.min(1024)),
        }
    }

    /// Builds the aggregate value once every element has arrived.
    fn complete(self) -> RedisResult<Value> {
        match self.kind {
            FrameKind::Array => Ok(Value::Array(self.items)),
            FrameKind::Set => Ok(Value::Set(self.items)),
            FrameKind::Map => Ok(Value::Map(pair_up(self.items))),
            FrameKind::Push => {
                let mut items = self.items.into_iter();
                let Some(first) = items.next() else {
                    fail!((ErrorKind::Protocol, "empty push frame"));
                };
                let Some(name) = first.as_bytes() else {
                    fail!((ErrorKind::Protocol, "push frame event is not a string"));
                };
                let kind = PushKind::from_name(name);
                Ok(Value::Push {
                    kind,
                    data: items.collect(),
                })
            }
            FrameKind::Attribute => {
                let mut items = self.items;
                let Some(data) = items.pop() else {
                    fail!((ErrorKind::Protocol, "attribute missing its value"));
                };
                Ok(Value::Attribute {
                    data: Box::new(data),
                    attributes: pair_up(items),
                })
            }
        }
    }
}

fn pair_up(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        pairs.push((key, value));
    }
    pairs
}

/// Outcome of consuming one token from the buffer: a finished value or
/// the header of an aggregate still being filled.
enum Step {
    Value(Value),
    Open(Frame),
}

/// Codec pairing the RESP decoder with a pass-through encoder for
/// already-packed commands.
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    stack: Vec<Frame>,
}

impl ValueCodec {
    fn advance(&mut self, src: &mut BytesMut) -> RedisResult<Option<Value>> {
        loop {
            let Some(step) = parse_step(src)? else {
                return Ok(None);
            };
            let value = match step {
                Step::Open(frame) => {
                    self.stack.push(frame);
                    continue;
                }
                Step::Value(value) => value,
            };
            if let Some(completed) = self.reduce(value)? {
                return Ok(Some(completed));
            }
        }
    }

    /// Feeds one completed value into the innermost frame, popping and
    /// completing frames as they fill up. `Some` once a top-level value
    /// is finished.
    fn reduce(&mut self, mut value: Value) -> RedisResult<Option<Value>> {
        loop {
            let Some(mut frame) = self.stack.pop() else {
                return Ok(Some(value));
            };
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                self.stack.push(frame);
                return Ok(None);
            }
            value = frame.complete()?;
        }
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = RedisError;

    fn decode(&mut self, src: &mut BytesMut) -> RedisResult<Option<Value>> {
        match self.advance(src) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.stack.clear();
                Err(err)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> RedisResult<Option<Value>> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() && self.stack.is_empty() => Ok(None),
            None => {
                self.stack.clear();
                fail!((ErrorKind::Protocol, "stream ended inside a reply"));
            }
        }
    }
}

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RedisError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> RedisResult<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.buf.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    /// Reads up to the next CRLF, consuming the terminator. `None` until
    /// the full line is buffered.
    fn line(&mut self) -> Option<&'a [u8]> {
        let haystack = &self.buf[self.pos..];
        let at = haystack.windows(2).position(|window| window == b"\r\n")?;
        self.pos += at + 2;
        Some(&haystack[..at])
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let chunk = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(chunk)
    }
}

fn parse_int(line: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| {
            RedisError::from((
                ErrorKind::Protocol,
                "invalid integer",
                String::from_utf8_lossy(line).into_owned(),
            ))
        })
}

fn parse_double(line: &[u8]) -> RedisResult<f64> {
    match line {
        b"inf" => Ok(f64::INFINITY),
        b"-inf" => Ok(f64::NEG_INFINITY),
        b"nan" => Ok(f64::NAN),
        _ => std::str::from_utf8(line)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                RedisError::from((
                    ErrorKind::Protocol,
                    "invalid double",
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }),
    }
}

/// Reads a `$`/`!`/`=`-style length-prefixed payload. `Ok(None)` until
/// complete, `Ok(Some(None))` for the nil (`-1`) form.
fn parse_blob<'a>(cursor: &mut Cursor<'a>) -> RedisResult<Option<Option<&'a [u8]>>> {
    let Some(line) = cursor.line() else {
        return Ok(None);
    };
    let len = parse_int(line)?;
    if len == -1 {
        return Ok(Some(None));
    }
    if len < 0 {
        fail!((ErrorKind::Protocol, "invalid bulk length", len.to_string()));
    }
    let len = len as usize;
    let Some(chunk) = cursor.take(len + 2) else {
        return Ok(None);
    };
    if &chunk[len..] != b"\r\n" {
        fail!((ErrorKind::Protocol, "bulk string missing CRLF terminator"));
    }
    Ok(Some(Some(&chunk[..len])))
}

/// Reads an array length prefix, where `-1` means a nil array.
fn parse_array_count(cursor: &mut Cursor<'_>) -> RedisResult<Option<Option<usize>>> {
    let Some(line) = cursor.line() else {
        return Ok(None);
    };
    let count = parse_int(line)?;
    if count == -1 {
        return Ok(Some(None));
    }
    if count < 0 {
        fail!((
            ErrorKind::Protocol,
            "invalid aggregate length",
            count.to_string()
        ));
    }
    Ok(Some(Some(count as usize)))
}

/// Reads an aggregate length prefix for types with no nil form.
fn parse_exact_count(cursor: &mut Cursor<'_>) -> RedisResult<Option<usize>> {
    let Some(line) = cursor.line() else {
        return Ok(None);
    };
    let count = parse_int(line)?;
    if count < 0 {
        fail!((
            ErrorKind::Protocol,
            "invalid aggregate length",
            count.to_string()
        ));
    }
    Ok(Some(count as usize))
}

/// Consumes one token from the front of `src`: a complete scalar or an
/// aggregate header. `None` leaves the buffer untouched until more
/// bytes arrive.
fn parse_step(src: &mut BytesMut) -> RedisResult<Option<Step>> {
    let mut cursor = Cursor {
        buf: &src[..],
        pos: 0,
    };
    match step_from_cursor(&mut cursor)? {
        Some(step) => {
            let consumed = cursor.pos;
            src.advance(consumed);
            Ok(Some(step))
        }
        None => Ok(None),
    }
}

fn step_from_cursor(cursor: &mut Cursor<'_>) -> RedisResult<Option<Step>> {
    let Some(prefix) = cursor.next_byte() else {
        return Ok(None);
    };
    match prefix {
        b'+' => Ok(cursor.line().map(|line| {
            Step::Value(if line == b"OK" {
                Value::Okay
            } else {
                Value::SimpleString(String::from_utf8_lossy(line).into_owned())
            })
        })),
        b'-' => Ok(cursor.line().map(|line| {
            Step::Value(Value::ServerError(ServerError::from_text(
                &String::from_utf8_lossy(line),
            )))
        })),
        b':' => match cursor.line() {
            Some(line) => Ok(Some(Step::Value(Value::Int(parse_int(line)?)))),
            None => Ok(None),
        },
        b'$' => match parse_blob(cursor)? {
            Some(Some(payload)) => Ok(Some(Step::Value(Value::BulkString(payload.to_vec())))),
            Some(None) => Ok(Some(Step::Value(Value::Nil))),
            None => Ok(None),
        },
        b'*' => match parse_array_count(cursor)? {
            Some(Some(0)) => Ok(Some(Step::Value(Value::Array(Vec::new())))),
            Some(Some(count)) => Ok(Some(Step::Open(Frame::new(FrameKind::Array, count)))),
            Some(None) => Ok(Some(Step::Value(Value::Nil))),
            None => Ok(None),
        },
        b'_' => match cursor.line() {
            Some(b"") => Ok(Some(Step::Value(Value::Nil))),
            Some(line) => fail!((
                ErrorKind::Protocol,
                "invalid null",
                String::from_utf8_lossy(line).into_owned()
            )),
            None => Ok(None),
        },
        b',' => match cursor.line() {
            Some(line) => Ok(Some(Step::Value(Value::Double(parse_double(line)?)))),
            None => Ok(None),
        },
        b'#' => match cursor.line() {
            Some(b"t") => Ok(Some(Step::Value(Value::Boolean(true)))),
            Some(b"f") => Ok(Some(Step::Value(Value::Boolean(false)))),
            Some(line) => fail!((
                ErrorKind::Protocol,
                "invalid boolean",
                String::from_utf8_lossy(line).into_owned()
            )),
            None => Ok(None),
        },
        b'(' => match cursor.line() {
            Some(line) => match BigInt::parse_bytes(line, 10) {
                Some(number) => Ok(Some(Step::Value(Value::BigNumber(number)))),
                None => fail!((
                    ErrorKind::Protocol,
                    "invalid big number",
                    String::from_utf8_lossy(line).into_owned()
                )),
            },
            None => Ok(None),
        },
        b'!' => match parse_blob(cursor)? {
            Some(Some(payload)) => Ok(Some(Step::Value(Value::ServerError(
                ServerError::from_text(&String::from_utf8_lossy(payload)),
            )))),
            Some(None) => fail!((ErrorKind::Protocol, "nil blob error")),
            None => Ok(None),
        },
        b'=' => match parse_blob(cursor)? {
            Some(Some(payload)) => {
                if payload.len() < 4 || payload[3] != b':' {
                    fail!((ErrorKind::Protocol, "invalid verbatim string"));
                }
                let format = match &payload[..3] {
                    b"txt" => VerbatimFormat::Text,
                    b"mkd" => VerbatimFormat::Markdown,
                    other => VerbatimFormat::Unknown(String::from_utf8_lossy(other).into_owned()),
                };
                Ok(Some(Step::Value(Value::VerbatimString {
                    format,
                    text: String::from_utf8_lossy(&payload[4..]).into_owned(),
                })))
            }
            Some(None) => fail!((ErrorKind::Protocol, "nil verbatim string")),
            None => Ok(None),
        },
        b'%' => match parse_exact_count(cursor)? {
            Some(0) => Ok(Some(Step::Value(Value::Map(Vec::new())))),
            Some(count) => {
                // Maps are exact pair counts on the wire, so 2N reads.
                let Some(remaining) = count.checked_mul(2) else {
                    fail!((
                        ErrorKind::Protocol,
                        "invalid aggregate length",
                        count.to_string()
                    ));
                };
                Ok(Some(Step::Open(Frame::new(FrameKind::Map, remaining))))
            }
            None => Ok(None),
        },
        b'~' => match parse_exact_count(cursor)? {
            Some(0) => Ok(Some(Step::Value(Value::Set(Vec::new())))),
            Some(count) => Ok(Some(Step::Open(Frame::new(FrameKind::Set, count)))),
            None => Ok(None),
        },
        b'>' => match parse_exact_count(cursor)? {
            Some(0) => fail!((ErrorKind::Protocol, "empty push frame")),
            Some(count) => Ok(Some(Step::Open(Frame::new(FrameKind::Push, count)))),
            None => Ok(None),
        },
        b'|' => match parse_exact_count(cursor)? {
            // 2N attribute values, then the value the attribute
            // decorates.
            Some(count) => {
                let Some(remaining) = count.checked_mul(2).and_then(|n| n.checked_add(1)) else {
                    fail!((
                        ErrorKind::Protocol,
                        "invalid aggregate length",
                        count.to_string()
                    ));
                };
                Ok(Some(Step::Open(Frame::new(FrameKind::Attribute, remaining))))
            }
            None => Ok(None),
        },
        other => fail!((
            ErrorKind::Protocol,
            "invalid response prefix",
            (other as char).to_string()
        )),
    }
}
