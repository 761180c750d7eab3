//! # Payment Stream
//!
//! Streaming payment data-plane: value is split into packets, sent over an untrusted path
//! and delivered to logical money streams at the far end.
//!
//! ## Layers
//! - [`core`]: canonical OER reader, writer and stream framing
//! - [`protocol`]: money stream ledgers, congestion control and the connection send loop
//! - [`transport`]: the plugin boundary with loopback and framed implementations
//! - [`config`], [`utils`]: configuration, logging, metrics and timeouts
//!
//! ## Example
//! ```rust
//! use payment_stream::config::ConnectionConfig;
//! use payment_stream::protocol::connection::{Connection, Role};
//! use payment_stream::transport::LoopbackPlugin;
//! use num_bigint::BigUint;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> payment_stream::error::Result<()> {
//! let (client_plugin, server_plugin) = LoopbackPlugin::pair();
//! let client = Connection::open(Role::Client, client_plugin, ConnectionConfig::default());
//! let server = Connection::open(Role::Server, server_plugin, ConnectionConfig::default());
//!
//! let stream = client.create_money_stream()?;
//! stream.send(100u32)?;
//! stream.flushed().await?;
//!
//! let incoming = server.accept_stream().await.expect("peer stream");
//! assert_eq!(incoming.amount_incoming(), BigUint::from(100u32));
//!
//! client.close().await;
//! server.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::PaymentConfig;
pub use core::reader::Reader;
pub use core::writer::{OerWrite, Writer};
pub use error::{OerError, PaymentError, Result};
pub use protocol::connection::{Connection, Role};
pub use protocol::money_stream::{MoneyStream, StreamEvent};
pub use transport::{DataHandler, LoopbackPlugin, Plugin};
