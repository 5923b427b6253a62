//! Typed binary wire codec.
//!
//! A [`BufferWriter`] accumulates an ordered list of typed values and packs
//! them into one buffer once the exact length is known. A [`BufferReader`]
//! walks a buffer with a cursor, one accessor per [`ByteType`].
//!
//! There is no self-describing schema: the order of writes *is* the schema.
//! Reading a buffer back with a different type sequence than it was written
//! with produces garbage, not an error.
//!
//! Encoding rules:
//! - all scalars are little-endian
//! - `u64` is two `u32` halves, low word first
//! - `bool` is a full byte, 255 for true and 0 for false
//! - strings are a `u16` byte length followed by raw UTF-8
//! - `Vec3` is three consecutive `f32` (12 bytes)

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::Vec3;

/// Byte value written for `true`.
pub const BOOL_TRUE: u8 = 255;

/// 2^64, the first integer past `u64::MAX`.
const U64_LIMIT: f64 = 18_446_744_073_709_551_616.0;

/// Wire encoding of a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ByteType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    U64 = 7,
    F64 = 8,
    Bool = 9,
    Str = 10,
    Vec3 = 11,
}

impl ByteType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ByteType::U8),
            1 => Some(ByteType::I8),
            2 => Some(ByteType::U16),
            3 => Some(ByteType::I16),
            4 => Some(ByteType::U32),
            5 => Some(ByteType::I32),
            6 => Some(ByteType::F32),
            7 => Some(ByteType::U64),
            8 => Some(ByteType::F64),
            9 => Some(ByteType::Bool),
            10 => Some(ByteType::Str),
            11 => Some(ByteType::Vec3),
            _ => None,
        }
    }

    /// Encoded width in bytes, or `None` for length-prefixed strings.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ByteType::U8 | ByteType::I8 | ByteType::Bool => Some(1),
            ByteType::U16 | ByteType::I16 => Some(2),
            ByteType::U32 | ByteType::I32 | ByteType::F32 => Some(4),
            ByteType::U64 | ByteType::F64 => Some(8),
            ByteType::Vec3 => Some(12),
            ByteType::Str => None,
        }
    }

    /// Numeric range for integer types. The upper bound is inclusive except
    /// for `U64`, whose maximum is not representable as an `f64`.
    fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            ByteType::U8 => Some((0.0, u8::MAX as f64)),
            ByteType::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            ByteType::U16 => Some((0.0, u16::MAX as f64)),
            ByteType::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            ByteType::U32 => Some((0.0, u32::MAX as f64)),
            ByteType::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            ByteType::U64 => Some((0.0, U64_LIMIT)),
            _ => None,
        }
    }
}

/// A typed value, tagged with the encoding it will use on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Vec3(Vec3),
}

impl Value {
    pub fn byte_type(&self) -> ByteType {
        match self {
            Value::U8(_) => ByteType::U8,
            Value::I8(_) => ByteType::I8,
            Value::U16(_) => ByteType::U16,
            Value::I16(_) => ByteType::I16,
            Value::U32(_) => ByteType::U32,
            Value::I32(_) => ByteType::I32,
            Value::F32(_) => ByteType::F32,
            Value::U64(_) => ByteType::U64,
            Value::F64(_) => ByteType::F64,
            Value::Bool(_) => ByteType::Bool,
            Value::Str(_) => ByteType::Str,
            Value::Vec3(_) => ByteType::Vec3,
        }
    }

    /// Exact number of bytes this value occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Str(s) => 2 + s.len(),
            other => other.byte_type().fixed_width().unwrap_or(0),
        }
    }

    /// Builds a value of a numeric type from an `f64`, failing when the
    /// number does not fit the type.
    pub fn from_number(ty: ByteType, n: f64) -> Result<Self, CodecError> {
        if let Some((lo, hi)) = ty.integer_range() {
            let too_big = if ty == ByteType::U64 { n >= hi } else { n > hi };
            if !n.is_finite() || n.fract() != 0.0 || n < lo || too_big {
                return Err(CodecError::OutOfRange { ty, value: n });
            }
        }
        let value = match ty {
            ByteType::U8 => Value::U8(n as u8),
            ByteType::I8 => Value::I8(n as i8),
            ByteType::U16 => Value::U16(n as u16),
            ByteType::I16 => Value::I16(n as i16),
            ByteType::U32 => Value::U32(n as u32),
            ByteType::I32 => Value::I32(n as i32),
            ByteType::U64 => Value::U64(n as u64),
            ByteType::F32 => {
                if n.is_finite() && n.abs() > f32::MAX as f64 {
                    return Err(CodecError::OutOfRange { ty, value: n });
                }
                Value::F32(n as f32)
            }
            ByteType::F64 => Value::F64(n),
            ByteType::Bool | ByteType::Str | ByteType::Vec3 => {
                return Err(CodecError::NotNumeric(ty));
            }
        };
        Ok(value)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::U8(v) => Some(v as f64),
            Value::I8(v) => Some(v as f64),
            Value::U16(v) => Some(v as f64),
            Value::I16(v) => Some(v as f64),
            Value::U32(v) => Some(v as f64),
            Value::I32(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            Value::Bool(_) | Value::Str(_) | Value::Vec3(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("{value} is out of range for {ty:?}")]
    OutOfRange { ty: ByteType, value: f64 },
    #[error("{0:?} is not a numeric byte type")]
    NotNumeric(ByteType),
    #[error("string of {len} bytes does not fit a u16 length prefix")]
    StringTooLong { len: usize },
    #[error("value of type {found:?} where {expected:?} was declared")]
    TypeMismatch { expected: ByteType, found: ByteType },
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown byte type tag {0}")]
    UnknownByteType(u8),
}

/// Write side: an ordered list of values packed on [`BufferWriter::finalize`].
#[derive(Debug, Clone, Default)]
pub struct BufferWriter {
    values: Vec<Value>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value. Strings longer than `u16::MAX` bytes are rejected.
    pub fn write(&mut self, value: Value) -> Result<&mut Self, CodecError> {
        if let Value::Str(s) = &value {
            if s.len() > u16::MAX as usize {
                return Err(CodecError::StringTooLong { len: s.len() });
            }
        }
        self.values.push(value);
        Ok(self)
    }

    /// Appends a value after checking it carries the declared type.
    pub fn write_typed(&mut self, ty: ByteType, value: Value) -> Result<&mut Self, CodecError> {
        if value.byte_type() != ty {
            return Err(CodecError::TypeMismatch {
                expected: ty,
                found: value.byte_type(),
            });
        }
        self.write(value)
    }

    /// Appends a number encoded as `ty`, failing fast when it does not fit.
    pub fn write_number(&mut self, ty: ByteType, n: f64) -> Result<&mut Self, CodecError> {
        let value = Value::from_number(ty, n)?;
        self.write(value)
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.values.push(Value::U8(v));
        self
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.values.push(Value::I8(v));
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.values.push(Value::U16(v));
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.values.push(Value::I16(v));
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.values.push(Value::U32(v));
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.values.push(Value::I32(v));
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.values.push(Value::F32(v));
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.values.push(Value::U64(v));
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.values.push(Value::F64(v));
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.values.push(Value::Bool(v));
        self
    }

    pub fn write_vec3(&mut self, v: Vec3) -> &mut Self {
        self.values.push(Value::Vec3(v));
        self
    }

    pub fn write_str(&mut self, s: &str) -> Result<&mut Self, CodecError> {
        self.write(Value::Str(s.to_string()))
    }

    /// Appends every value of another writer, preserving order.
    pub fn append(&mut self, other: &BufferWriter) -> &mut Self {
        self.values.extend(other.values.iter().cloned());
        self
    }

    /// Number of values written so far.
    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Exact packed length in bytes.
    pub fn byte_len(&self) -> usize {
        self.values.iter().map(Value::encoded_len).sum()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Packs every written value into one buffer.
    pub fn finalize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_len());
        for value in &self.values {
            encode_value(&mut buf, value);
        }
        buf.freeze()
    }
}

fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::U8(v) => buf.put_u8(*v),
        Value::I8(v) => buf.put_i8(*v),
        Value::U16(v) => buf.put_u16_le(*v),
        Value::I16(v) => buf.put_i16_le(*v),
        Value::U32(v) => buf.put_u32_le(*v),
        Value::I32(v) => buf.put_i32_le(*v),
        Value::F32(v) => buf.put_f32_le(*v),
        Value::U64(v) => {
            buf.put_u32_le(*v as u32);
            buf.put_u32_le((*v >> 32) as u32);
        }
        Value::F64(v) => buf.put_f64_le(*v),
        Value::Bool(v) => buf.put_u8(if *v { BOOL_TRUE } else { 0 }),
        Value::Str(s) => {
            // Length was validated on write.
            buf.put_u16_le(s.len() as u16);
            buf.put_slice(s.as_bytes());
        }
        Value::Vec3(v) => {
            buf.put_f32_le(v.x);
            buf.put_f32_le(v.y);
            buf.put_f32_le(v.z);
        }
    }
}

/// Read side: a cursor over a packed buffer.
#[derive(Debug, Clone)]
pub struct BufferReader {
    data: Bytes,
    cursor: usize,
}

impl BufferReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// The whole underlying buffer, independent of the cursor.
    pub fn buffer(&self) -> &Bytes {
        &self.data
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_slice(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.take::<1>()?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let low = self.read_u32()? as u64;
        let high = self.read_u32()? as u64;
        Ok(low | (high << 32))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? == BOOL_TRUE)
    }

    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let raw = self.take_slice(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, CodecError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Reads one value of a type known only at runtime.
    pub fn read_value(&mut self, ty: ByteType) -> Result<Value, CodecError> {
        Ok(match ty {
            ByteType::U8 => Value::U8(self.read_u8()?),
            ByteType::I8 => Value::I8(self.read_i8()?),
            ByteType::U16 => Value::U16(self.read_u16()?),
            ByteType::I16 => Value::I16(self.read_i16()?),
            ByteType::U32 => Value::U32(self.read_u32()?),
            ByteType::I32 => Value::I32(self.read_i32()?),
            ByteType::F32 => Value::F32(self.read_f32()?),
            ByteType::U64 => Value::U64(self.read_u64()?),
            ByteType::F64 => Value::F64(self.read_f64()?),
            ByteType::Bool => Value::Bool(self.read_bool()?),
            ByteType::Str => Value::Str(self.read_str()?),
            ByteType::Vec3 => Value::Vec3(self.read_vec3()?),
        })
    }

    /// Reads a `u8` byte type tag.
    pub fn read_byte_type(&mut self) -> Result<ByteType, CodecError> {
        let tag = self.read_u8()?;
        ByteType::from_u8(tag).ok_or(CodecError::UnknownByteType(tag))
    }
}
