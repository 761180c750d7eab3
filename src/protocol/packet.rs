//! # Packet Values
//!
//! Typed wire values exchanged with the plugin boundary.
//!
//! Only the fields the connection needs are modelled: a [`Prepare`] carries an amount and
//! an opaque payload, the peer answers with a [`Fulfill`] or a [`Reject`], and the
//! payload of every Prepare is a [`StreamPacket`] holding the per-stream [`Frame`]s.
//!
//! ## Wire Format
//! ```text
//! Prepare:      [12] [Amount VarUInt] [Data VarOctetString]
//! Fulfill:      [13] [Data VarOctetString]
//! Reject:       [14] [Code(3)] [Message VarOctetString] [Data VarOctetString]
//! StreamPacket: [Version(1)] [Sequence VarUInt] [Count VarUInt] [Frame]*
//! Frame:        [Type(1)] [Body VarOctetString]
//! ```

use crate::core::reader::Reader;
use crate::core::writer::{var_uint_size, OerWrite, Writer};
use crate::error::OerError;
use bytes::Bytes;
use num_bigint::BigUint;
use std::fmt;

type CodecResult<T> = std::result::Result<T, OerError>;

pub const TYPE_PREPARE: u8 = 12;
pub const TYPE_FULFILL: u8 = 13;
pub const TYPE_REJECT: u8 = 14;

/// Stream packet format version
pub const STREAM_PACKET_VERSION: u8 = 1;

pub const FRAME_MONEY: u8 = 0x01;
pub const FRAME_STREAM_CLOSE: u8 = 0x02;

fn expect_type(reader: &mut Reader, expected: u8) -> CodecResult<()> {
    let found = reader.read_u8()?;
    if found != expected {
        return Err(OerError::Encoding(format!(
            "Unexpected packet type {found}, expected {expected}"
        )));
    }
    Ok(())
}

/// Conditional transfer of `amount` towards the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    pub amount: BigUint,
    pub data: Bytes,
}

impl Prepare {
    pub fn to_bytes(&self) -> CodecResult<Bytes> {
        let mut writer = Writer::new();
        writer.write_u8(TYPE_PREPARE)?;
        writer.write_var_uint(&self.amount)?;
        writer.write_var_octet_string(&self.data)?;
        Ok(writer.into_bytes())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        expect_type(&mut reader, TYPE_PREPARE)?;
        Ok(Self {
            amount: reader.read_var_uint()?,
            data: reader.read_var_octet_string()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fulfill {
    pub data: Bytes,
}

/// Three-character rejection code, e.g. `F08`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RejectCode([u8; 3]);

impl RejectCode {
    pub const BAD_REQUEST: Self = Self(*b"F00");
    pub const INVALID_PACKET: Self = Self(*b"F01");
    pub const UNREACHABLE: Self = Self(*b"F02");
    pub const UNEXPECTED_PAYMENT: Self = Self(*b"F06");
    pub const AMOUNT_TOO_LARGE: Self = Self(*b"F08");
    pub const APPLICATION_ERROR: Self = Self(*b"F99");
    pub const INTERNAL_ERROR: Self = Self(*b"T00");
    pub const INSUFFICIENT_LIQUIDITY: Self = Self(*b"T04");

    pub const fn new(code: [u8; 3]) -> Self {
        Self(code)
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Capacity rejection, possibly carrying [`AmountTooLarge`] data
    pub fn is_amount_too_large(&self) -> bool {
        *self == Self::AMOUNT_TOO_LARGE
    }

    /// `T..` codes: the same packet may succeed later
    pub fn is_temporary(&self) -> bool {
        self.0[0] == b'T'
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RejectCode({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub code: RejectCode,
    pub message: String,
    pub data: Bytes,
}

impl Reject {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Bytes::new(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }
}

/// Outcome of a Prepare, as returned by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Reply {
    pub fn to_bytes(&self) -> CodecResult<Bytes> {
        let mut writer = Writer::new();
        match self {
            Reply::Fulfill(fulfill) => {
                writer.write_u8(TYPE_FULFILL)?;
                writer.write_var_octet_string(&fulfill.data)?;
            }
            Reply::Reject(reject) => {
                writer.write_u8(TYPE_REJECT)?;
                writer.write_octet_string(reject.code.as_bytes(), 3)?;
                writer.write_var_octet_string(reject.message.as_bytes())?;
                writer.write_var_octet_string(&reject.data)?;
            }
        }
        Ok(writer.into_bytes())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        match reader.read_u8()? {
            TYPE_FULFILL => Ok(Reply::Fulfill(Fulfill {
                data: reader.read_var_octet_string()?,
            })),
            TYPE_REJECT => {
                let code = reader.read_octet_string(3)?;
                let message = reader.read_var_octet_string()?;
                Ok(Reply::Reject(Reject {
                    code: RejectCode([code[0], code[1], code[2]]),
                    message: String::from_utf8_lossy(&message).into_owned(),
                    data: reader.read_var_octet_string()?,
                }))
            }
            other => Err(OerError::Encoding(format!(
                "Unexpected reply type {other}"
            ))),
        }
    }
}

impl From<Reject> for Reply {
    fn from(reject: Reject) -> Self {
        Reply::Reject(reject)
    }
}

/// Data attached to an `F08` rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountTooLarge {
    pub received_amount: BigUint,
    pub maximum_amount: BigUint,
}

impl AmountTooLarge {
    /// A maximum at or above the amount that was refused carries no information
    pub fn is_sensible(&self) -> bool {
        self.maximum_amount < self.received_amount
    }

    pub fn to_bytes(&self) -> CodecResult<Bytes> {
        let mut writer = Writer::new();
        writer.write_var_uint(&self.received_amount)?;
        writer.write_var_uint(&self.maximum_amount)?;
        Ok(writer.into_bytes())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        Ok(Self {
            received_amount: reader.read_var_uint()?,
            maximum_amount: reader.read_var_uint()?,
        })
    }
}

/// Per-stream instruction carried inside a [`StreamPacket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `shares` of the packet amount belong to `stream_id`
    Money { stream_id: u64, shares: BigUint },
    StreamClose { stream_id: u64 },
}

impl Frame {
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Money { .. } => FRAME_MONEY,
            Frame::StreamClose { .. } => FRAME_STREAM_CLOSE,
        }
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            Frame::Money { stream_id, .. } | Frame::StreamClose { stream_id } => *stream_id,
        }
    }

    fn body_len(&self) -> usize {
        let id_len = var_uint_size(&BigUint::from(self.stream_id()));
        match self {
            Frame::Money { shares, .. } => id_len + var_uint_size(shares),
            Frame::StreamClose { .. } => id_len,
        }
    }

    fn write_body<W: OerWrite + ?Sized>(&self, writer: &mut W) -> CodecResult<()> {
        writer.write_var_uint_u64(self.stream_id())?;
        if let Frame::Money { shares, .. } = self {
            writer.write_var_uint(shares)?;
        }
        Ok(())
    }

    fn read_body(frame_type: u8, body: Bytes) -> CodecResult<Option<Self>> {
        let mut reader = Reader::new(body);
        let frame = match frame_type {
            FRAME_MONEY => Frame::Money {
                stream_id: reader.read_var_uint_u64()?,
                shares: reader.read_var_uint()?,
            },
            FRAME_STREAM_CLOSE => Frame::StreamClose {
                stream_id: reader.read_var_uint_u64()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }
}

/// Payload of a Prepare: sequence number plus frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPacket {
    pub sequence: u64,
    pub frames: Vec<Frame>,
}

impl StreamPacket {
    pub fn to_bytes(&self) -> CodecResult<Bytes> {
        let mut writer = Writer::new();
        writer.write_u8(STREAM_PACKET_VERSION)?;
        writer.write_var_uint_u64(self.sequence)?;
        writer.write_var_uint_u64(self.frames.len() as u64)?;
        for frame in &self.frames {
            writer.write_u8(frame.frame_type())?;
            let mut body = writer.create_var_octet_string(frame.body_len())?;
            frame.write_body(&mut body)?;
            body.finish()?;
        }
        Ok(writer.into_bytes())
    }

    /// Decode a packet, skipping frames of unknown type
    pub fn from_bytes(bytes: impl Into<Bytes>) -> CodecResult<Self> {
        let mut reader = Reader::new(bytes);
        let version = reader.read_u8()?;
        if version != STREAM_PACKET_VERSION {
            return Err(OerError::Encoding(format!(
                "Unsupported stream packet version {version}"
            )));
        }
        let sequence = reader.read_var_uint_u64()?;
        let count = reader.read_var_uint_u64()?;

        let mut frames = Vec::new();
        for _ in 0..count {
            let frame_type = reader.read_u8()?;
            let body = reader.read_var_octet_string()?;
            if let Some(frame) = Frame::read_body(frame_type, body)? {
                frames.push(frame);
            }
        }
        Ok(Self { sequence, frames })
    }

    /// Sum of the shares of every money frame
    pub fn total_shares(&self) -> BigUint {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Money { shares, .. } => Some(shares),
                Frame::StreamClose { .. } => None,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_prepare_layout() {
        let prepare = Prepare {
            amount: BigUint::from(500u32),
            data: Bytes::from_static(b"ab"),
        };
        let bytes = prepare.to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[12, 0x02, 0x01, 0xf4, 0x02, b'a', b'b']);
        assert_eq!(Prepare::from_bytes(bytes).unwrap(), prepare);
    }

    #[test]
    fn test_prepare_refuses_other_types() {
        let fulfill = Reply::Fulfill(Fulfill::default()).to_bytes().unwrap();
        assert!(matches!(
            Prepare::from_bytes(fulfill),
            Err(OerError::Encoding(_))
        ));
    }

    #[test]
    fn test_reject_carries_code_message_and_data() {
        let data = AmountTooLarge {
            received_amount: BigUint::from(2000u32),
            maximum_amount: BigUint::from(1500u32),
        }
        .to_bytes()
        .unwrap();
        let reply: Reply = Reject::new(RejectCode::AMOUNT_TOO_LARGE, "too much")
            .with_data(data.clone())
            .into();

        let decoded = Reply::from_bytes(reply.to_bytes().unwrap()).unwrap();
        let Reply::Reject(reject) = decoded else {
            panic!("expected reject");
        };
        assert!(reject.code.is_amount_too_large());
        assert_eq!(reject.code.to_string(), "F08");
        assert_eq!(reject.message, "too much");

        let details = AmountTooLarge::from_bytes(reject.data).unwrap();
        assert_eq!(details.maximum_amount, BigUint::from(1500u32));
        assert!(details.is_sensible());
    }

    #[test]
    fn test_reject_code_classes() {
        assert!(RejectCode::INSUFFICIENT_LIQUIDITY.is_temporary());
        assert!(!RejectCode::INSUFFICIENT_LIQUIDITY.is_amount_too_large());
        assert!(!RejectCode::UNREACHABLE.is_temporary());
        assert!(!RejectCode::new(*b"R00").is_temporary());
    }

    #[test]
    fn test_nonsense_maximum_is_not_sensible() {
        let details = AmountTooLarge {
            received_amount: BigUint::from(100u32),
            maximum_amount: BigUint::from(100u32),
        };
        assert!(!details.is_sensible());
    }

    #[test]
    fn test_truncated_amount_too_large_data_fails() {
        assert!(AmountTooLarge::from_bytes(Bytes::from_static(&[0x02, 0x07])).is_err());
        assert!(AmountTooLarge::from_bytes(Bytes::new()).is_err());
    }

    #[test]
    fn test_stream_packet_frames() {
        let packet = StreamPacket {
            sequence: 7,
            frames: vec![
                Frame::Money {
                    stream_id: 1,
                    shares: BigUint::from(117u32),
                },
                Frame::Money {
                    stream_id: 3,
                    shares: BigUint::from(204u32),
                },
                Frame::StreamClose { stream_id: 5 },
            ],
        };
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[STREAM_PACKET_VERSION, 0x01, 0x07, 0x01]);
        // First frame: type, body length, stream id, shares
        assert_eq!(&bytes[4..10], &[0x03, FRAME_MONEY, 4, 0x01, 0x01, 0x01]);

        let decoded = StreamPacket::from_bytes(bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.total_shares(), BigUint::from(321u32));
    }

    #[test]
    fn test_unknown_frames_are_skipped() {
        let bytes = Bytes::from_static(&[
            STREAM_PACKET_VERSION,
            0x01,
            0x00,
            0x01,
            0x02,
            0x7f,
            0x02,
            0xaa,
            0xbb,
            FRAME_STREAM_CLOSE,
            0x02,
            0x01,
            0x04,
        ]);
        let packet = StreamPacket::from_bytes(bytes).unwrap();
        assert_eq!(packet.frames, vec![Frame::StreamClose { stream_id: 4 }]);
    }

    #[test]
    fn test_frame_count_beyond_data_is_a_range_error() {
        let bytes = Bytes::from_static(&[STREAM_PACKET_VERSION, 0x01, 0x00, 0x01, 0x09]);
        assert!(matches!(
            StreamPacket::from_bytes(bytes),
            Err(OerError::Range { .. })
        ));
    }
}
