// Wire codec for bus envelopes
//
// [frame_len:4][tag:1][send:1][addr_len:4][addr][reply_len:4][reply][body]
// Bodies start with a null flag byte except Ping. Failure body:
// [1][code:4][reason_len:4][reason][trace_len:4][trace] or [0]
use bytes::{Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::failure::{Failure, FailureCode};
use crate::{BusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Ping = 0,
    Buffer = 1,
    Boolean = 2,
    ByteArray = 3,
    Byte = 4,
    Char = 5,
    Double = 6,
    Float = 7,
    Int = 8,
    Long = 9,
    Short = 10,
    String = 11,
    Json = 12,
    Failure = 13,
}

impl TryFrom<u8> for TypeTag {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, DecodeError> {
        Ok(match value {
            0 => TypeTag::Ping,
            1 => TypeTag::Buffer,
            2 => TypeTag::Boolean,
            3 => TypeTag::ByteArray,
            4 => TypeTag::Byte,
            5 => TypeTag::Char,
            6 => TypeTag::Double,
            7 => TypeTag::Float,
            8 => TypeTag::Int,
            9 => TypeTag::Long,
            10 => TypeTag::Short,
            11 => TypeTag::String,
            12 => TypeTag::Json,
            13 => TypeTag::Failure,
            other => return Err(DecodeError::UnknownTypeTag(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Buffer(Bytes),
    ByteArray(Vec<u8>),
    Boolean(bool),
    Byte(i8),
    Char(char),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Short(i16),
    String(String),
    Json(serde_json::Value),
    Failure(Failure),
}

impl Body {
    pub fn tag(&self) -> TypeTag {
        match self {
            Body::Buffer(_) => TypeTag::Buffer,
            Body::ByteArray(_) => TypeTag::ByteArray,
            Body::Boolean(_) => TypeTag::Boolean,
            Body::Byte(_) => TypeTag::Byte,
            Body::Char(_) => TypeTag::Char,
            Body::Double(_) => TypeTag::Double,
            Body::Float(_) => TypeTag::Float,
            Body::Int(_) => TypeTag::Int,
            Body::Long(_) => TypeTag::Long,
            Body::Short(_) => TypeTag::Short,
            Body::String(_) => TypeTag::String,
            Body::Json(_) => TypeTag::Json,
            Body::Failure(_) => TypeTag::Failure,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Body::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Body::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Body::Failure(f) => Some(f),
            _ => None,
        }
    }
}

macro_rules! body_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Body {
            fn from(v: $ty) -> Self {
                Body::$variant(v)
            }
        })*
    };
}

body_from! {
    Bytes => Buffer,
    Vec<u8> => ByteArray,
    bool => Boolean,
    i8 => Byte,
    char => Char,
    f64 => Double,
    f32 => Float,
    i32 => Int,
    i64 => Long,
    i16 => Short,
    String => String,
    serde_json::Value => Json,
    Failure => Failure,
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::String(v.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown type tag: {0}")]
    UnknownTypeTag(u8),

    #[error("invalid flag byte {value} at offset {pos}")]
    InvalidFlag { pos: usize, value: u8 },

    #[error("negative length {len} at offset {pos}")]
    NegativeLength { pos: usize, len: i32 },

    #[error("invalid UTF-8 at offset {pos}")]
    InvalidUtf8 { pos: usize },

    #[error("invalid char scalar: {0:#x}")]
    InvalidChar(u32),

    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("frame length mismatch: declared {declared}, actual {actual}")]
    FrameLength { declared: usize, actual: usize },

    #[error("missing address")]
    MissingAddress,
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("envelope has an empty address")]
    EmptyAddress,

    #[error("{field} too large to encode: {len} bytes")]
    TooLarge { field: &'static str, len: usize },

    #[error("body tag {tag:?} does not match body {body:?}")]
    TagMismatch { tag: TypeTag, body: TypeTag },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message as it travels between processes.
///
/// A present body always matches `tag`; an absent body is encoded as the
/// tag's null form.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    send: bool,
    address: String,
    reply_address: Option<String>,
    tag: TypeTag,
    body: Option<Body>,
}

impl Envelope {
    pub fn new(send: bool, address: impl Into<String>, body: impl Into<Body>) -> Self {
        let body = body.into();
        Self {
            send,
            address: address.into(),
            reply_address: None,
            tag: body.tag(),
            body: Some(body),
        }
    }

    /// Envelope of kind `tag` with no body.
    pub fn empty(send: bool, address: impl Into<String>, tag: TypeTag) -> Self {
        Self {
            send,
            address: address.into(),
            reply_address: None,
            tag,
            body: None,
        }
    }

    pub fn ping(address: impl Into<String>) -> Self {
        Self::empty(true, address, TypeTag::Ping)
    }

    /// Sets the address replies should be sent to. An empty string clears it.
    pub fn with_reply_address(mut self, reply_address: impl Into<String>) -> Self {
        let reply_address = reply_address.into();
        self.reply_address = (!reply_address.is_empty()).then_some(reply_address);
        self
    }

    pub fn is_send(&self) -> bool {
        self.send
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn into_body(self) -> Option<Body> {
        self.body
    }

    pub fn is_failure(&self) -> bool {
        self.tag == TypeTag::Failure
    }

    /// Builds the point-to-point envelope answering this one.
    ///
    /// Failures are terminal: asking for a reply to a failure envelope is
    /// rejected with [`BusError::UnsupportedOperation`].
    pub fn reply_envelope(&self, body: impl Into<Body>) -> Result<Envelope> {
        if self.is_failure() {
            return Err(BusError::UnsupportedOperation(
                "cannot reply to a failure".into(),
            ));
        }
        let reply_address = self.reply_address.as_ref().ok_or(BusError::NoReplyAddress)?;
        Ok(Envelope::new(true, reply_address.clone(), body))
    }

    pub fn to_frame(&self) -> std::result::Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(64);
        encode(self, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn from_frame(frame: &[u8]) -> std::result::Result<Self, DecodeError> {
        decode(frame)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(Body::Failure(fail)) => write!(f, "Failure({}:{})", fail.code(), fail.reason()),
            _ => write!(f, "{:?}({})", self.tag, self.address),
        }
    }
}

/// Appends one complete frame for `env` to `buf`.
pub fn encode<B: WriteBuffer + ?Sized>(
    env: &Envelope,
    buf: &mut B,
) -> std::result::Result<(), EncodeError> {
    if env.address.is_empty() {
        return Err(EncodeError::EmptyAddress);
    }
    if let Some(body) = &env.body {
        if body.tag() != env.tag {
            return Err(EncodeError::TagMismatch {
                tag: env.tag,
                body: body.tag(),
            });
        }
    }

    let start = buf.len();
    buf.append_int(0);
    buf.append_byte(env.tag as u8);
    buf.append_byte(env.send as u8);
    write_string(buf, "address", &env.address)?;
    write_string(buf, "reply address", env.reply_address.as_deref().unwrap_or(""))?;
    write_body(buf, env.tag, env.body.as_ref())?;

    let frame_len = checked_len("frame", buf.len() - start - 4)?;
    buf.set_int(start, frame_len);
    Ok(())
}

/// Decodes exactly one frame occupying the whole of `buf`.
pub fn decode<B: ReadBuffer + ?Sized>(buf: &B) -> std::result::Result<Envelope, DecodeError> {
    let mut cur = Cursor::new(buf);
    let declared = cur.length()?;
    let actual = buf.len() - 4;
    if declared != actual {
        return Err(DecodeError::FrameLength { declared, actual });
    }

    let tag = TypeTag::try_from(cur.byte()?)?;
    let send = cur.flag()?;
    let address = cur.string()?;
    if address.is_empty() {
        return Err(DecodeError::MissingAddress);
    }
    let reply_address = cur.string()?;
    let body = read_body(&mut cur, tag)?;

    if cur.pos != buf.len() {
        return Err(DecodeError::FrameLength {
            declared,
            actual: cur.pos - 4,
        });
    }

    Ok(Envelope {
        send,
        address,
        reply_address: (!reply_address.is_empty()).then_some(reply_address),
        tag,
        body,
    })
}

/// Splits one complete frame off the front of a stream buffer.
///
/// Returns `Ok(None)` while the buffer holds less than a whole frame, leaving
/// it untouched.
pub fn try_decode(buf: &mut BytesMut) -> std::result::Result<Option<Envelope>, DecodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let declared = buf[..].get_int(0)?;
    if declared < 0 {
        return Err(DecodeError::NegativeLength {
            pos: 0,
            len: declared,
        });
    }
    let total = 4 + declared as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let frame = buf.split_to(total);
    decode(&frame[..]).map(Some)
}

fn checked_len(field: &'static str, len: usize) -> std::result::Result<i32, EncodeError> {
    i32::try_from(len).map_err(|_| EncodeError::TooLarge { field, len })
}

fn write_string<B: WriteBuffer + ?Sized>(
    buf: &mut B,
    field: &'static str,
    s: &str,
) -> std::result::Result<(), EncodeError> {
    write_bytes(buf, field, s.as_bytes())
}

fn write_bytes<B: WriteBuffer + ?Sized>(
    buf: &mut B,
    field: &'static str,
    bytes: &[u8],
) -> std::result::Result<(), EncodeError> {
    buf.append_int(checked_len(field, bytes.len())?);
    buf.append_bytes(bytes);
    Ok(())
}

fn write_body<B: WriteBuffer + ?Sized>(
    buf: &mut B,
    tag: TypeTag,
    body: Option<&Body>,
) -> std::result::Result<(), EncodeError> {
    if tag == TypeTag::Ping {
        return Ok(());
    }
    let Some(body) = body else {
        buf.append_byte(0);
        return Ok(());
    };
    buf.append_byte(1);
    match body {
        Body::Buffer(b) => write_bytes(buf, "body", b)?,
        Body::ByteArray(b) => write_bytes(buf, "body", b)?,
        Body::Boolean(v) => buf.append_byte(*v as u8),
        Body::Byte(v) => buf.append_byte(*v as u8),
        Body::Char(v) => buf.append_int(*v as u32 as i32),
        Body::Double(v) => buf.append_bytes(&v.to_be_bytes()),
        Body::Float(v) => buf.append_bytes(&v.to_be_bytes()),
        Body::Int(v) => buf.append_int(*v),
        Body::Long(v) => buf.append_bytes(&v.to_be_bytes()),
        Body::Short(v) => buf.append_bytes(&v.to_be_bytes()),
        Body::String(s) => write_string(buf, "body", s)?,
        Body::Json(v) => {
            let encoded = serde_json::to_vec(v)?;
            write_bytes(buf, "body", &encoded)?;
        }
        Body::Failure(f) => write_failure(buf, f)?,
    }
    Ok(())
}

// Null flag is already written by the caller.
fn write_failure<B: WriteBuffer + ?Sized>(
    buf: &mut B,
    failure: &Failure,
) -> std::result::Result<(), EncodeError> {
    buf.append_int(failure.code().as_i32());
    write_string(buf, "failure reason", failure.reason())?;
    write_string(buf, "failure trace", failure.trace())
}

fn read_body<B: ReadBuffer + ?Sized>(
    cur: &mut Cursor<'_, B>,
    tag: TypeTag,
) -> std::result::Result<Option<Body>, DecodeError> {
    if tag == TypeTag::Ping || !cur.flag()? {
        return Ok(None);
    }
    let body = match tag {
        TypeTag::Ping => unreachable!("ping has no body"),
        TypeTag::Buffer => Body::Buffer(Bytes::copy_from_slice(cur.sized_bytes()?)),
        TypeTag::ByteArray => Body::ByteArray(cur.sized_bytes()?.to_vec()),
        TypeTag::Boolean => Body::Boolean(cur.flag()?),
        TypeTag::Byte => Body::Byte(cur.byte()? as i8),
        TypeTag::Char => {
            let scalar = cur.int()? as u32;
            Body::Char(char::from_u32(scalar).ok_or(DecodeError::InvalidChar(scalar))?)
        }
        TypeTag::Double => Body::Double(f64::from_be_bytes(cur.array()?)),
        TypeTag::Float => Body::Float(f32::from_be_bytes(cur.array()?)),
        TypeTag::Int => Body::Int(cur.int()?),
        TypeTag::Long => Body::Long(i64::from_be_bytes(cur.array()?)),
        TypeTag::Short => Body::Short(i16::from_be_bytes(cur.array()?)),
        TypeTag::String => Body::String(cur.string()?),
        TypeTag::Json => {
            let raw = cur.sized_bytes()?;
            Body::Json(
                serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?,
            )
        }
        TypeTag::Failure => {
            let code = FailureCode(cur.int()?);
            let reason = cur.string()?;
            let trace = cur.string()?;
            Body::Failure(Failure::with_trace(code, reason, trace))
        }
    };
    Ok(Some(body))
}

struct Cursor<'a, B: ?Sized> {
    buf: &'a B,
    pos: usize,
}

impl<'a, B: ReadBuffer + ?Sized> Cursor<'a, B> {
    fn new(buf: &'a B) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> std::result::Result<u8, DecodeError> {
        let b = self.buf.get_byte(self.pos)?;
        self.pos += 1;
        Ok(b)
    }

    fn flag(&mut self) -> std::result::Result<bool, DecodeError> {
        let pos = self.pos;
        match self.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidFlag { pos, value }),
        }
    }

    fn int(&mut self) -> std::result::Result<i32, DecodeError> {
        let v = self.buf.get_int(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    fn length(&mut self) -> std::result::Result<usize, DecodeError> {
        let pos = self.pos;
        let len = self.int()?;
        usize::try_from(len).map_err(|_| DecodeError::NegativeLength { pos, len })
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let raw = self.buf.get_bytes(self.pos, self.pos + N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        self.pos += N;
        Ok(out)
    }

    fn sized_bytes(&mut self) -> std::result::Result<&'a [u8], DecodeError> {
        let len = self.length()?;
        let raw = self.buf.get_bytes(self.pos, self.pos + len)?;
        self.pos += len;
        Ok(raw)
    }

    fn string(&mut self) -> std::result::Result<String, DecodeError> {
        let len = self.length()?;
        let s = self.buf.get_string(self.pos, self.pos + len)?;
        self.pos += len;
        Ok(s)
    }
}
