//! # Payment Protocol
//!
//! Money streams, packet amount discovery, and the connection that ties them together.
//!
//! ## Components
//! - **MoneyStream**: per-stream ledger with two-phase holds
//! - **Congestion**: search for the largest amount a path carries per packet
//! - **Packet**: typed Prepare / Fulfill / Reject values and stream frames
//! - **Connection**: sequential send loop plus the receive path

pub mod congestion;
pub mod connection;
pub mod money_stream;
pub mod packet;
