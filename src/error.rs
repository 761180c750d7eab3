//! # Error Types
//!
//! Error handling for the payment stream core.
//!
//! Two enums cover the crate:
//! - [`OerError`]: everything the binary codec can report. Codec errors are always fatal
//!   to the current encode/decode attempt and are propagated unmodified.
//! - [`PaymentError`]: the crate-level error, wrapping codec and I/O failures together with
//!   ledger, rejection and connection errors.
//!
//! ## Example Usage
//! ```rust
//! use payment_stream::core::reader::Reader;
//! use payment_stream::error::{OerError, PaymentError, Result};
//!
//! fn read_amount(bytes: &[u8]) -> Result<u64> {
//!     let mut reader = Reader::new(bytes.to_vec());
//!     Ok(reader.read_var_uint_u64()?)
//! }
//!
//! match read_amount(&[0x04, 0x01]) {
//!     Err(PaymentError::Oer(OerError::Range { requested, available })) => {
//!         assert_eq!((requested, available), (4, 1));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use num_bigint::BigUint;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_NO_BOOKMARK: &str = "Cannot restore bookmark when no bookmark set";
    pub const ERR_UINT_ZERO_LENGTH: &str = "UInt length must be greater than zero";
    pub const ERR_INT_ZERO_LENGTH: &str = "Int length must be greater than zero";
    pub const ERR_UINT_TOO_LONG: &str = "UInts longer than 8 bytes must be encoded as VarUInts";
    pub const ERR_INT_TOO_LONG: &str = "Ints longer than 8 bytes must be encoded as VarInts";
    pub const ERR_VAR_UINT_ZERO_LENGTH: &str = "UInt of length 0 is invalid";
    pub const ERR_VAR_INT_ZERO_LENGTH: &str = "Int of length 0 is invalid";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_PACKET_AMOUNT_TOO_SMALL: &str =
        "Maximum packet amount is too small to send any money";
    pub const ERR_NO_DATA_HANDLER: &str = "No data handler registered";
}

/// Errors raised by the OER reader and writer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OerError {
    /// Buffer underrun on read
    #[error("Tried to read {requested} bytes, but only {available} bytes available")]
    Range { requested: usize, available: usize },

    /// Invalid length byte, zero-length field or out-of-range width
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Valid bytes that break the minimal-encoding rule
    #[error("Encoding is not canonical: {value} encoded in {bytes} bytes")]
    NonCanonical { value: String, bytes: usize },

    /// Value too large for the requested numeric representation
    #[error("Value does not fit {0} without sacrificing precision")]
    Precision(&'static str),

    /// Writer capacity exceeded
    #[error("writer cannot exceed capacity ({requested} bytes requested, {capacity} bytes capacity)")]
    Capacity { capacity: usize, requested: usize },

    /// Fixed-length write given the wrong amount of input
    #[error("Octet string length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Bookmark misuse
    #[error("{0}")]
    State(&'static str),
}

/// PaymentError is the primary error type for all ledger and connection operations
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Codec error: {0}")]
    Oer(#[from] OerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream {0} already closed")]
    ClosedStream(u64),

    #[error("Cannot receive {requested}, only {available} available")]
    InsufficientFunds {
        requested: BigUint,
        available: BigUint,
    },

    #[error("Packet rejected with {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Stream {stream_id} failed: {reason}")]
    StreamFailed { stream_id: u64, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using PaymentError
pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_message_names_both_counts() {
        let err = OerError::Range {
            requested: 7,
            available: 6,
        };
        assert_eq!(
            err.to_string(),
            "Tried to read 7 bytes, but only 6 bytes available"
        );
    }

    #[test]
    fn test_non_canonical_message_names_value_and_width() {
        let err = OerError::NonCanonical {
            value: "1".to_string(),
            bytes: 2,
        };
        assert_eq!(err.to_string(), "Encoding is not canonical: 1 encoded in 2 bytes");
    }

    #[test]
    fn test_codec_errors_convert_into_payment_errors() {
        let err: PaymentError = OerError::State(constants::ERR_NO_BOOKMARK).into();
        assert!(matches!(err, PaymentError::Oer(OerError::State(_))));
    }
}
