//! # OER Reader
//!
//! Cursor-based decoder for Octet Encoding Rules primitives.
//!
//! The reader wraps a shared [`Bytes`] buffer, so cloning a reader or slicing the unread
//! remainder into a new one never copies payload data.
//!
//! ## Encodings
//! - **Fixed-width integers**: 1-8 bytes, big-endian. Wider values must use the
//!   variable-length form.
//! - **Variable-length integers**: one length byte (1-255) followed by the big-endian
//!   magnitude (two's complement for signed values).
//! - **Length prefixes**: a single byte `0..=127`, or `0x80 | n` followed by `n` bytes
//!   holding the length.
//!
//! ## Canonical Encoding
//! Every decoder rejects non-minimal encodings with [`OerError::NonCanonical`]: a length
//! prefix in long form that fits the short form, long-form lengths with a leading zero
//! byte, and variable-length integers carrying redundant leading bytes.

use crate::error::{constants, OerError};
use bytes::Bytes;
use num_bigint::BigUint;
use num_traits::ToPrimitive;

/// Widest integer allowed in fixed-width form
pub const MAX_FIXED_WIDTH: usize = 8;

type CodecResult<T> = std::result::Result<T, OerError>;

macro_rules! fixed_width_readers {
    ($($read:ident, $peek:ident, $skip:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a big-endian `", stringify!($ty), "`")]
            pub fn $read(&mut self) -> CodecResult<$ty> {
                let value = self.$peek()?;
                self.cursor += std::mem::size_of::<$ty>();
                Ok(value)
            }

            #[doc = concat!("Peek a big-endian `", stringify!($ty), "` without advancing")]
            pub fn $peek(&self) -> CodecResult<$ty> {
                let bytes = self.peek(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes);
                Ok(<$ty>::from_be_bytes(raw))
            }

            #[doc = concat!("Skip a `", stringify!($ty), "`")]
            pub fn $skip(&mut self) -> CodecResult<()> {
                self.skip(std::mem::size_of::<$ty>())
            }
        )*
    };
}

/// Decoder over an immutable byte buffer with a movable cursor
#[derive(Debug, Clone, Default)]
pub struct Reader {
    buffer: Bytes,
    cursor: usize,
    /// Single saved cursor, never a stack
    bookmark: Option<usize>,
}

impl From<Bytes> for Reader {
    fn from(buffer: Bytes) -> Self {
        Self::new(buffer)
    }
}

impl Reader {
    /// Create a reader positioned at the start of `buffer`
    pub fn new(buffer: impl Into<Bytes>) -> Self {
        Self {
            buffer: buffer.into(),
            cursor: 0,
            bookmark: None,
        }
    }

    /// Create a reader over the bytes `other` has not consumed yet
    pub fn from_remaining(other: &Reader) -> Self {
        Self::new(other.buffer.slice(other.cursor..))
    }

    /// The underlying buffer
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Current byte offset
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total buffer length, consumed bytes included
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Fail with [`OerError::Range`] unless `bytes` more bytes can be read
    pub fn ensure_available(&self, bytes: usize) -> CodecResult<()> {
        let available = self.remaining();
        if bytes > available {
            return Err(OerError::Range {
                requested: bytes,
                available,
            });
        }
        Ok(())
    }

    /// Save the current cursor, replacing any earlier bookmark
    pub fn bookmark(&mut self) {
        self.bookmark = Some(self.cursor);
    }

    /// Rewind to the saved cursor and clear the bookmark
    pub fn restore(&mut self) -> CodecResult<()> {
        let saved = self
            .bookmark
            .take()
            .ok_or(OerError::State(constants::ERR_NO_BOOKMARK))?;
        self.cursor = saved;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw octets
    // ------------------------------------------------------------------

    /// Read `len` raw bytes
    pub fn read(&mut self, len: usize) -> CodecResult<Bytes> {
        let bytes = self.peek(len)?;
        self.cursor += len;
        Ok(bytes)
    }

    /// Return the next `len` bytes without advancing
    pub fn peek(&self, len: usize) -> CodecResult<Bytes> {
        self.ensure_available(len)?;
        Ok(self.buffer.slice(self.cursor..self.cursor + len))
    }

    /// Advance past `len` bytes
    pub fn skip(&mut self, len: usize) -> CodecResult<()> {
        self.ensure_available(len)?;
        self.cursor += len;
        Ok(())
    }

    /// Read a fixed-length octet string
    pub fn read_octet_string(&mut self, len: usize) -> CodecResult<Bytes> {
        self.read(len)
    }

    pub fn peek_octet_string(&self, len: usize) -> CodecResult<Bytes> {
        self.peek(len)
    }

    pub fn skip_octet_string(&mut self, len: usize) -> CodecResult<()> {
        self.skip(len)
    }

    // ------------------------------------------------------------------
    // Fixed-width integers
    // ------------------------------------------------------------------

    /// Read a `len`-byte unsigned big-endian integer
    pub fn read_uint(&mut self, len: usize) -> CodecResult<u64> {
        let value = self.peek_uint(len)?;
        self.cursor += len;
        Ok(value)
    }

    pub fn peek_uint(&self, len: usize) -> CodecResult<u64> {
        check_fixed_width(
            len,
            constants::ERR_UINT_ZERO_LENGTH,
            constants::ERR_UINT_TOO_LONG,
        )?;
        Ok(fold_be(&self.peek(len)?))
    }

    /// Advance past a `len`-byte unsigned integer without decoding it
    pub fn skip_uint(&mut self, len: usize) -> CodecResult<()> {
        check_fixed_width(
            len,
            constants::ERR_UINT_ZERO_LENGTH,
            constants::ERR_UINT_TOO_LONG,
        )?;
        self.skip(len)
    }

    /// Read a `len`-byte two's complement big-endian integer
    pub fn read_int(&mut self, len: usize) -> CodecResult<i64> {
        let value = self.peek_int(len)?;
        self.cursor += len;
        Ok(value)
    }

    pub fn peek_int(&self, len: usize) -> CodecResult<i64> {
        check_fixed_width(
            len,
            constants::ERR_INT_ZERO_LENGTH,
            constants::ERR_INT_TOO_LONG,
        )?;
        Ok(sign_extend(fold_be(&self.peek(len)?), len))
    }

    pub fn skip_int(&mut self, len: usize) -> CodecResult<()> {
        check_fixed_width(
            len,
            constants::ERR_INT_ZERO_LENGTH,
            constants::ERR_INT_TOO_LONG,
        )?;
        self.skip(len)
    }

    fixed_width_readers! {
        read_u8, peek_u8, skip_u8 => u8;
        read_u16, peek_u16, skip_u16 => u16;
        read_u32, peek_u32, skip_u32 => u32;
        read_u64, peek_u64, skip_u64 => u64;
        read_i8, peek_i8, skip_i8 => i8;
        read_i16, peek_i16, skip_i16 => i16;
        read_i32, peek_i32, skip_i32 => i32;
        read_i64, peek_i64, skip_i64 => i64;
    }

    // ------------------------------------------------------------------
    // Variable-length integers
    // ------------------------------------------------------------------

    /// Locate the magnitude of the variable-length integer at the cursor.
    ///
    /// Returns the magnitude bytes and the total encoded size.
    fn peek_var_magnitude(&self, zero_length: &'static str) -> CodecResult<(Bytes, usize)> {
        self.ensure_available(1)?;
        let len = self.buffer[self.cursor] as usize;
        if len == 0 {
            return Err(OerError::Encoding(zero_length.to_string()));
        }
        let available = self.remaining() - 1;
        if len > available {
            return Err(OerError::Range {
                requested: len,
                available,
            });
        }
        let start = self.cursor + 1;
        Ok((self.buffer.slice(start..start + len), len + 1))
    }

    fn peek_var_uint_encoded(&self) -> CodecResult<(BigUint, usize)> {
        let (magnitude, consumed) = self.peek_var_magnitude(constants::ERR_VAR_UINT_ZERO_LENGTH)?;
        let value = BigUint::from_bytes_be(&magnitude);
        if magnitude.len() > 1 && magnitude[0] == 0 {
            return Err(OerError::NonCanonical {
                value: value.to_string(),
                bytes: magnitude.len(),
            });
        }
        Ok((value, consumed))
    }

    /// Read a variable-length unsigned integer of any size
    pub fn read_var_uint(&mut self) -> CodecResult<BigUint> {
        let (value, consumed) = self.peek_var_uint_encoded()?;
        self.cursor += consumed;
        Ok(value)
    }

    pub fn peek_var_uint(&self) -> CodecResult<BigUint> {
        Ok(self.peek_var_uint_encoded()?.0)
    }

    pub fn skip_var_uint(&mut self) -> CodecResult<()> {
        let (_, consumed) = self.peek_var_uint_encoded()?;
        self.cursor += consumed;
        Ok(())
    }

    /// Read a variable-length unsigned integer that must fit a `u64`.
    ///
    /// The cursor does not move when the value is too large.
    pub fn read_var_uint_u64(&mut self) -> CodecResult<u64> {
        let (value, consumed) = self.peek_var_uint_encoded()?;
        let value = value.to_u64().ok_or(OerError::Precision("a u64"))?;
        self.cursor += consumed;
        Ok(value)
    }

    pub fn peek_var_uint_u64(&self) -> CodecResult<u64> {
        self.peek_var_uint()?
            .to_u64()
            .ok_or(OerError::Precision("a u64"))
    }

    fn peek_var_int_encoded(&self) -> CodecResult<(i64, usize)> {
        let (magnitude, consumed) = self.peek_var_magnitude(constants::ERR_VAR_INT_ZERO_LENGTH)?;
        let len = magnitude.len();
        if len > MAX_FIXED_WIDTH {
            return Err(OerError::Encoding(format!("Int of length {len} is too large")));
        }
        let value = sign_extend(fold_be(&magnitude), len);
        if len > 1 {
            let redundant_sign = match magnitude[0] {
                0x00 => magnitude[1] & 0x80 == 0,
                0xff => magnitude[1] & 0x80 != 0,
                _ => false,
            };
            if redundant_sign {
                return Err(OerError::NonCanonical {
                    value: value.to_string(),
                    bytes: len,
                });
            }
        }
        Ok((value, consumed))
    }

    /// Read a variable-length signed integer (at most 8 magnitude bytes)
    pub fn read_var_int(&mut self) -> CodecResult<i64> {
        let (value, consumed) = self.peek_var_int_encoded()?;
        self.cursor += consumed;
        Ok(value)
    }

    pub fn peek_var_int(&self) -> CodecResult<i64> {
        Ok(self.peek_var_int_encoded()?.0)
    }

    pub fn skip_var_int(&mut self) -> CodecResult<()> {
        let (_, consumed) = self.peek_var_int_encoded()?;
        self.cursor += consumed;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Length prefixes and variable-length octet strings
    // ------------------------------------------------------------------

    /// Decode the length prefix at the cursor, returning `(length, prefix size)`
    fn peek_length_prefix_encoded(&self) -> CodecResult<(usize, usize)> {
        self.ensure_available(1)?;
        let first = self.buffer[self.cursor];
        if first & 0x80 == 0 {
            return Ok((first as usize, 1));
        }

        let width = (first & 0x7f) as usize;
        let available = self.remaining() - 1;
        if width > available {
            return Err(OerError::Range {
                requested: width,
                available,
            });
        }
        if width == 0 {
            return Err(OerError::NonCanonical {
                value: "0".to_string(),
                bytes: 0,
            });
        }

        let start = self.cursor + 1;
        let raw = &self.buffer[start..start + width];
        let value = BigUint::from_bytes_be(raw);
        if raw[0] == 0 || value <= BigUint::from(0x7fu8) {
            return Err(OerError::NonCanonical {
                value: value.to_string(),
                bytes: width,
            });
        }
        let length = value.to_usize().ok_or(OerError::Precision("a usize"))?;
        Ok((length, width + 1))
    }

    /// Read a canonical length prefix
    pub fn read_length_prefix(&mut self) -> CodecResult<usize> {
        let (length, consumed) = self.peek_length_prefix_encoded()?;
        self.cursor += consumed;
        Ok(length)
    }

    fn peek_var_octet_string_encoded(&self) -> CodecResult<(Bytes, usize)> {
        let (length, prefix) = self.peek_length_prefix_encoded()?;
        let available = self.remaining() - prefix;
        if length > available {
            return Err(OerError::Range {
                requested: length,
                available,
            });
        }
        let start = self.cursor + prefix;
        Ok((self.buffer.slice(start..start + length), prefix + length))
    }

    /// Read a length-prefixed octet string
    pub fn read_var_octet_string(&mut self) -> CodecResult<Bytes> {
        let (bytes, consumed) = self.peek_var_octet_string_encoded()?;
        self.cursor += consumed;
        Ok(bytes)
    }

    pub fn peek_var_octet_string(&self) -> CodecResult<Bytes> {
        Ok(self.peek_var_octet_string_encoded()?.0)
    }

    pub fn skip_var_octet_string(&mut self) -> CodecResult<()> {
        let (_, consumed) = self.peek_var_octet_string_encoded()?;
        self.cursor += consumed;
        Ok(())
    }
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

#[inline]
fn fold_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Interpret the low `len` bytes of `raw` as two's complement
#[inline]
fn sign_extend(raw: u64, len: usize) -> i64 {
    let shift = 64 - 8 * len as u32;
    ((raw << shift) as i64) >> shift
}
