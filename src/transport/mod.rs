//! # Transport Layer
//!
//! The plugin boundary between a [`Connection`](crate::protocol::connection::Connection)
//! and whatever carries its packets.
//!
//! A plugin offers one request/response operation: hand it an encoded Prepare, get back
//! the encoded reply. Incoming Prepares travel the other way through a registered
//! [`DataHandler`].
//!
//! ## Plugins
//! - **Loopback**: an in-process pair that simulates a connector path
//! - **Framed**: request/response over any `AsyncRead + AsyncWrite` byte stream

pub mod framed;
pub mod loopback;

use crate::error::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::{Arc, Weak};

/// Answers Prepares arriving from the peer
pub trait DataHandler: Send + Sync {
    /// Return the encoded Fulfill or Reject for an encoded Prepare
    fn handle_data(&self, data: Bytes) -> Bytes;
}

/// Packet transport used by a connection
pub trait Plugin: Send + Sync + 'static {
    /// Send one encoded Prepare and wait for the encoded reply
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>>;

    /// Route Prepares from the peer to `handler`
    fn register_data_handler(&self, _handler: Weak<dyn DataHandler>) {}

    fn deregister_data_handler(&self) {}
}

impl<P: Plugin + ?Sized> Plugin for Arc<P> {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        (**self).send_data(data)
    }

    fn register_data_handler(&self, handler: Weak<dyn DataHandler>) {
        (**self).register_data_handler(handler)
    }

    fn deregister_data_handler(&self) {
        (**self).deregister_data_handler()
    }
}

pub use framed::{serve_framed, FramedPlugin};
pub use loopback::LoopbackPlugin;
