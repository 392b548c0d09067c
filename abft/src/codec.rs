//! Binary wire encoding
//!
//! Every network message implements [`Wire`]. Encoding is a fixed big-endian layout; each
//! protocol message type is a closed enum with a leading tag byte, and decoding an unknown tag
//! is an error rather than a silent default.

use core::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use generic_ec::{Point, Scalar};

use crate::{Ciphersuite, NodeId};

/// Upper bound on any length-prefixed byte string we agree to decode
pub const MAX_BYTES_LEN: usize = 16 * 1024 * 1024;

/// Message that can be sent over the wire
pub trait Wire: Sized {
    /// Appends encoded message to `buf`
    fn encode(&self, buf: &mut BytesMut);
    /// Decodes message from the front of `buf`, advancing it
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Encodes message into a standalone byte string
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
    /// Decodes message that spans exactly the whole `bytes`
    fn from_bytes(mut bytes: Bytes) -> Result<Self, DecodeError> {
        let msg = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(Reason::TrailingBytes(bytes.remaining()).into());
        }
        Ok(msg)
    }
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(Reason::UnexpectedEof {
            expected: len,
            remaining: buf.remaining(),
        }
        .into())
    } else {
        Ok(())
    }
}

/// Reads a byte
pub fn get_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Reads big-endian `u16`
pub fn get_u16(buf: &mut Bytes) -> Result<u16, DecodeError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

/// Reads big-endian `u32`
pub fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

/// Reads big-endian `u64`
pub fn get_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Reads a bool encoded as a single `0`/`1` byte
pub fn get_bool(buf: &mut Bytes) -> Result<bool, DecodeError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        tag => Err(DecodeError::unknown_tag("bool", tag)),
    }
}

/// Writes a byte string prefixed with its `u32` length
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Reads a byte string written by [`put_bytes`]
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_u32(buf)? as usize;
    if len > MAX_BYTES_LEN {
        return Err(Reason::TooLarge {
            len,
            max: MAX_BYTES_LEN,
        }
        .into());
    }
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// Writes a point prefixed with its one-byte length
pub fn put_point<C: Ciphersuite>(buf: &mut BytesMut, point: &Point<C::Curve>) {
    let bytes = C::serialize_point(point);
    let bytes = bytes.as_ref();
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

/// Reads a point written by [`put_point`]
pub fn get_point<C: Ciphersuite>(buf: &mut Bytes) -> Result<Point<C::Curve>, DecodeError> {
    let len = usize::from(get_u8(buf)?);
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    C::deserialize_point(&bytes).map_err(|_| Reason::InvalidPoint.into())
}

/// Writes a fixed-size scalar
pub fn put_scalar<C: Ciphersuite>(buf: &mut BytesMut, scalar: &Scalar<C::Curve>) {
    buf.put_slice(C::serialize_scalar(scalar).as_ref());
}

/// Reads a scalar written by [`put_scalar`]
pub fn get_scalar<C: Ciphersuite>(buf: &mut Bytes) -> Result<Scalar<C::Curve>, DecodeError> {
    ensure(buf, C::SCALAR_SIZE)?;
    let bytes = buf.split_to(C::SCALAR_SIZE);
    C::deserialize_scalar(&bytes).map_err(|_| Reason::InvalidScalar.into())
}

/// Writes a list of points prefixed with `u16` count
pub fn put_points<C: Ciphersuite>(buf: &mut BytesMut, points: &[Point<C::Curve>]) {
    buf.put_u16(points.len() as u16);
    for point in points {
        put_point::<C>(buf, point);
    }
}

/// Reads a list of points written by [`put_points`]
pub fn get_points<C: Ciphersuite>(buf: &mut Bytes) -> Result<Vec<Point<C::Curve>>, DecodeError> {
    let len = get_u16(buf)?;
    (0..len).map(|_| get_point::<C>(buf)).collect()
}

/// Writes a list of `u16` prefixed with `u16` count
pub fn put_u16s(buf: &mut BytesMut, list: &[u16]) {
    buf.put_u16(list.len() as u16);
    for x in list {
        buf.put_u16(*x);
    }
}

/// Reads a list written by [`put_u16s`]
pub fn get_u16s(buf: &mut Bytes) -> Result<Vec<u16>, DecodeError> {
    let len = get_u16(buf)?;
    (0..len).map(|_| get_u16(buf)).collect()
}

impl Wire for NodeId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(buf, 32)?;
        let mut id = [0u8; 32];
        buf.copy_to_slice(&mut id);
        Ok(NodeId::new(id))
    }
}

/// Message cannot be decoded
#[derive(Debug)]
pub struct DecodeError(Reason);

#[derive(Debug)]
enum Reason {
    UnexpectedEof { expected: usize, remaining: usize },
    UnknownTag { what: &'static str, tag: u8 },
    TooLarge { len: usize, max: usize },
    TrailingBytes(usize),
    InvalidPoint,
    InvalidScalar,
    Malformed(&'static str),
}

impl DecodeError {
    /// Tag byte doesn't correspond to any variant of `what`
    pub fn unknown_tag(what: &'static str, tag: u8) -> Self {
        Self(Reason::UnknownTag { what, tag })
    }
    /// Message is well-formed byte-wise, but violates its own structure
    pub fn malformed(what: &'static str) -> Self {
        Self(Reason::Malformed(what))
    }
}

impl From<Reason> for DecodeError {
    fn from(err: Reason) -> Self {
        Self(err)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::UnexpectedEof {
                expected,
                remaining,
            } => write!(
                f,
                "unexpected end of message: expected {expected} more bytes, \
                only {remaining} remaining"
            ),
            Reason::UnknownTag { what, tag } => write!(f, "unknown {what} tag {tag:#04x}"),
            Reason::TooLarge { len, max } => {
                write!(f, "length {len} exceeds maximum allowed {max}")
            }
            Reason::TrailingBytes(n) => write!(f, "{n} trailing bytes after the message"),
            Reason::InvalidPoint => f.write_str("invalid point"),
            Reason::InvalidScalar => f.write_str("invalid scalar"),
            Reason::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}
