//! # Core Codec Components
//!
//! Canonical Octet Encoding Rules (OER) primitives and stream framing.
//!
//! ## Components
//! - **Reader**: cursor-based decoder with a single-slot bookmark
//! - **Writer**: growable or bounded encoder, plus nested length-prefixed regions
//! - **Codec**: Tokio codec for length-prefixed frames over byte streams
//!
//! ## Wire Format
//! ```text
//! VarUInt:      [Len(1)] [Magnitude(Len)]
//! VarOctetStr:  [Len prefix (1..=9)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Non-canonical encodings are rejected on read
//! - Reads are bounds-checked before any allocation

pub mod codec;
pub mod reader;
pub mod writer;
