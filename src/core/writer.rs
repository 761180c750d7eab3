//! # OER Writer
//!
//! Append-only encoder for the primitives decoded by [`Reader`](super::reader::Reader).
//!
//! Encoding helpers live on the [`OerWrite`] trait, implemented by both the growable
//! [`Writer`] and the bounded [`NestedWriter`] handed out by
//! [`Writer::create_var_octet_string`]. Every helper emits its whole encoding with a single
//! capacity check, so a failed write never leaves a partial field behind.
//!
//! ## Usage
//! ```rust
//! use payment_stream::core::writer::{OerWrite, Writer};
//! use num_bigint::BigUint;
//!
//! let mut writer = Writer::new();
//! writer.write_var_uint(&BigUint::from(258u32)).unwrap();
//! writer.write_var_octet_string(b"hi").unwrap();
//! assert_eq!(writer.into_bytes().as_ref(), &[0x02, 0x01, 0x02, 0x02, b'h', b'i']);
//! ```

use super::reader::MAX_FIXED_WIDTH;
use crate::error::{constants, OerError};
use bytes::{Bytes, BytesMut};
use num_bigint::BigUint;

type CodecResult<T> = std::result::Result<T, OerError>;

/// Largest magnitude a variable-length integer can carry behind its single length byte
pub const MAX_VAR_INT_WIDTH: usize = 255;

/// Encoding operations shared by every OER destination
pub trait OerWrite {
    /// Append raw bytes, failing with [`OerError::Capacity`] when they do not fit
    fn write(&mut self, bytes: &[u8]) -> CodecResult<()>;

    /// Write `value` as a `len`-byte unsigned big-endian integer
    fn write_uint(&mut self, value: u64, len: usize) -> CodecResult<()> {
        check_fixed_width(
            len,
            constants::ERR_UINT_ZERO_LENGTH,
            constants::ERR_UINT_TOO_LONG,
        )?;
        if len < MAX_FIXED_WIDTH && value >> (8 * len) != 0 {
            return Err(OerError::Encoding(format!(
                "UInt {value} does not fit in {len} bytes"
            )));
        }
        self.write(&value.to_be_bytes()[MAX_FIXED_WIDTH - len..])
    }

    /// Write `value` as a `len`-byte two's complement integer
    fn write_int(&mut self, value: i64, len: usize) -> CodecResult<()> {
        check_fixed_width(
            len,
            constants::ERR_INT_ZERO_LENGTH,
            constants::ERR_INT_TOO_LONG,
        )?;
        let shift = 64 - 8 * len as u32;
        if (value << shift) >> shift != value {
            return Err(OerError::Encoding(format!(
                "Int {value} does not fit in {len} bytes"
            )));
        }
        self.write(&value.to_be_bytes()[MAX_FIXED_WIDTH - len..])
    }

    fn write_u8(&mut self, value: u8) -> CodecResult<()> {
        self.write(&[value])
    }

    fn write_u16(&mut self, value: u16) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_u32(&mut self, value: u32) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_i8(&mut self, value: i8) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_i16(&mut self, value: i16) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_i32(&mut self, value: i32) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_i64(&mut self, value: i64) -> CodecResult<()> {
        self.write(&value.to_be_bytes())
    }

    /// Write an arbitrary-precision unsigned integer in its minimal variable-length form
    fn write_var_uint(&mut self, value: &BigUint) -> CodecResult<()> {
        self.write_var_uint_bytes(&value.to_bytes_be())
    }

    fn write_var_uint_u64(&mut self, value: u64) -> CodecResult<()> {
        self.write_var_uint_bytes(&value.to_be_bytes())
    }

    /// Write a big-endian magnitude as a variable-length unsigned integer.
    ///
    /// Leading zero bytes are dropped so the output stays canonical.
    fn write_var_uint_bytes(&mut self, magnitude: &[u8]) -> CodecResult<()> {
        if magnitude.is_empty() {
            return Err(OerError::Encoding(
                constants::ERR_VAR_UINT_ZERO_LENGTH.to_string(),
            ));
        }
        let first = magnitude
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(magnitude.len() - 1);
        write_var_magnitude(self, &magnitude[first..])
    }

    /// Write a signed integer in its minimal two's complement variable-length form
    fn write_var_int(&mut self, value: i64) -> CodecResult<()> {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = match bytes[start] {
                0x00 => bytes[start + 1] & 0x80 == 0,
                0xff => bytes[start + 1] & 0x80 != 0,
                _ => false,
            };
            if !redundant {
                break;
            }
            start += 1;
        }
        write_var_magnitude(self, &bytes[start..])
    }

    /// Write a fixed-length octet string whose length the schema already fixes
    fn write_octet_string(&mut self, bytes: &[u8], expected_len: usize) -> CodecResult<()> {
        if bytes.len() != expected_len {
            return Err(OerError::LengthMismatch {
                expected: expected_len,
                actual: bytes.len(),
            });
        }
        self.write(bytes)
    }

    /// Write a canonical length prefix
    fn write_length_prefix(&mut self, len: usize) -> CodecResult<()> {
        self.write(&encode_length_prefix(len))
    }

    /// Write a length-prefixed octet string
    fn write_var_octet_string(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let mut encoded = encode_length_prefix(bytes.len());
        encoded.extend_from_slice(bytes);
        self.write(&encoded)
    }
}

/// Growable output buffer with an optional hard capacity
#[derive(Debug, Clone, Default)]
pub struct Writer {
    buffer: BytesMut,
    capacity: Option<usize>,
}

impl Writer {
    /// Create an unbounded writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer that refuses to grow past `capacity` bytes
    pub fn bounded(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy of the output so far; the writer stays usable
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Finalize into an immutable buffer
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    fn check_capacity(&self, additional: usize) -> CodecResult<()> {
        if let Some(capacity) = self.capacity {
            let requested = self.buffer.len() + additional;
            if requested > capacity {
                return Err(OerError::Capacity {
                    capacity,
                    requested,
                });
            }
        }
        Ok(())
    }

    /// Reserve a length-prefixed region of exactly `len` bytes.
    ///
    /// The prefix is written immediately; the returned [`NestedWriter`] fills the region and
    /// refuses to write past it.
    pub fn create_var_octet_string(&mut self, len: usize) -> CodecResult<NestedWriter<'_>> {
        let prefix = encode_length_prefix(len);
        self.check_capacity(prefix.len() + len)?;
        self.buffer.extend_from_slice(&prefix);

        let start = self.buffer.len();
        self.buffer.resize(start + len, 0);
        Ok(NestedWriter {
            region: &mut self.buffer[start..],
            written: 0,
        })
    }
}

impl OerWrite for Writer {
    fn write(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.check_capacity(bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }
}

/// Bounded writer over a region reserved by [`Writer::create_var_octet_string`]
#[derive(Debug)]
pub struct NestedWriter<'a> {
    region: &'a mut [u8],
    written: usize,
}

impl NestedWriter<'_> {
    /// Bytes written into the region so far
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Size of the reserved region
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Check that the reserved region was filled exactly
    pub fn finish(self) -> CodecResult<()> {
        if self.written != self.region.len() {
            return Err(OerError::LengthMismatch {
                expected: self.region.len(),
                actual: self.written,
            });
        }
        Ok(())
    }
}

impl OerWrite for NestedWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let requested = self.written + bytes.len();
        if requested > self.region.len() {
            return Err(OerError::Capacity {
                capacity: self.region.len(),
                requested,
            });
        }
        self.region[self.written..requested].copy_from_slice(bytes);
        self.written = requested;
        Ok(())
    }
}

/// Size in bytes of the canonical length prefix for `len`
pub fn length_prefix_size(len: usize) -> usize {
    if len <= 0x7f {
        1
    } else {
        1 + significant_bytes(len)
    }
}

/// Size in bytes of the variable-length encoding of `value`
pub fn var_uint_size(value: &BigUint) -> usize {
    let bits = value.bits() as usize;
    1 + bits.div_ceil(8).max(1)
}

fn encode_length_prefix(len: usize) -> Vec<u8> {
    if len <= 0x7f {
        return vec![len as u8];
    }
    let width = significant_bytes(len);
    let mut encoded = Vec::with_capacity(1 + width);
    encoded.push(0x80 | width as u8);
    encoded.extend_from_slice(&len.to_be_bytes()[std::mem::size_of::<usize>() - width..]);
    encoded
}

fn significant_bytes(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    (bits as usize).div_ceil(8).max(1)
}

fn write_var_magnitude<W: OerWrite + ?Sized>(writer: &mut W, magnitude: &[u8]) -> CodecResult<()> {
    let width = magnitude.len();
    if width > MAX_VAR_INT_WIDTH {
        return Err(OerError::Encoding(format!(
            "Integer of length {width} is too large"
        )));
    }
    let mut encoded = Vec::with_capacity(1 + width);
    encoded.push(width as u8);
    encoded.extend_from_slice(magnitude);
    writer.write(&encoded)
}

fn check_fixed_width(
    len: usize,
    zero_length: &'static str,
    too_long: &'static str,
) -> CodecResult<()> {
    if len == 0 {
        return Err(OerError::Encoding(zero_length.to_string()));
    }
    if len > MAX_FIXED_WIDTH {
        return Err(OerError::Encoding(too_long.to_string()));
    }
    Ok(())
}
