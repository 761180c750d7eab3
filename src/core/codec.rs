//! # Frame Codec
//!
//! Tokio codec that frames whole messages on a byte stream with the canonical OER
//! length prefix, so a peer reading the stream sees exactly the var-octet-string
//! encoding the [`Reader`] expects.
//!
//! ## Wire Format
//! ```text
//! [Length prefix (1..=9)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Frames above `max_frame_size` are refused before any allocation
//! - Non-canonical length prefixes are a decode error, never silently accepted

use crate::core::reader::Reader;
use crate::core::writer::{OerWrite, Writer};
use crate::error::{PaymentError, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default frame ceiling (32 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024;

/// Length-prefixed framing for [`Bytes`] payloads
#[derive(Debug, Clone, Copy)]
pub struct OerFrameCodec {
    max_frame_size: usize,
}

impl Default for OerFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl OerFrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for OerFrameCodec {
    type Item = Bytes;
    type Error = PaymentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        // Long-form prefixes need their length bytes before they can be parsed
        let prefix_len = if first & 0x80 == 0 {
            1
        } else {
            1 + (first & 0x7f) as usize
        };
        if src.len() < prefix_len {
            return Ok(None);
        }

        let mut reader = Reader::new(Bytes::copy_from_slice(&src[..prefix_len]));
        let frame_len = reader.read_length_prefix()?;
        if frame_len > self.max_frame_size {
            return Err(PaymentError::OversizedFrame(frame_len));
        }

        let total = prefix_len + frame_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for OerFrameCodec {
    type Error = PaymentError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_size {
            return Err(PaymentError::OversizedFrame(item.len()));
        }
        let mut prefix = Writer::new();
        prefix.write_length_prefix(item.len())?;

        dst.reserve(prefix.len() + item.len());
        dst.extend_from_slice(prefix.as_slice());
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::OerError;

    #[test]
    fn test_round_trip_short_and_long_frames() {
        let mut codec = OerFrameCodec::default();
        let mut buf = BytesMut::new();

        for size in [0usize, 1, 127, 128, 4096] {
            let payload = Bytes::from(vec![0x5a; size]);
            codec.encode(payload.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(decoded, payload);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut codec = OerFrameCodec::default();
        let mut full = BytesMut::new();
        codec.encode(Bytes::from(vec![1u8; 300]), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..100]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 100);
    }

    #[test]
    fn test_oversized_frames_refused() {
        let mut codec = OerFrameCodec::new(16);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from(vec![0u8; 17]), &mut buf),
            Err(PaymentError::OversizedFrame(17))
        ));

        let mut incoming = BytesMut::from(&[0x81u8, 0x80][..]);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(PaymentError::OversizedFrame(128))
        ));
    }

    #[test]
    fn test_non_canonical_prefix_is_an_error() {
        let mut codec = OerFrameCodec::default();
        let mut incoming = BytesMut::from(&[0x81u8, 0x05, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(PaymentError::Oer(OerError::NonCanonical { bytes: 1, .. }))
        ));
    }
}
