//! # Framed Plugin
//!
//! Request/response transport over any byte stream (TCP, Unix sockets, in-memory duplex).
//! Each encoded packet travels as one [`OerFrameCodec`] frame; the reply is the next
//! frame read back. One request is in flight at a time.
//!
//! The stream is owned by a spawned task that answers each caller through a oneshot
//! channel. A caller that gives up (timeout, drop) only drops its receiver; the task
//! still reads the late reply and discards it, so it can never answer a later request.

use crate::config::TransportConfig;
use crate::core::codec::OerFrameCodec;
use crate::error::{PaymentError, Result};
use crate::transport::{DataHandler, Plugin};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument};

struct Request {
    data: Bytes,
    reply_tx: oneshot::Sender<Result<Bytes>>,
}

/// Client end: sends a frame and waits for the answering frame
pub struct FramedPlugin {
    request_tx: mpsc::UnboundedSender<Request>,
}

impl FramedPlugin {
    /// Spawn the I/O task for `io`. Must be called inside a Tokio runtime.
    pub fn new<T>(io: T, max_frame_size: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let framed = Framed::new(io, OerFrameCodec::new(max_frame_size));
        tokio::spawn(drive(framed, request_rx));
        Self { request_tx }
    }

    pub fn from_config<T>(io: T, config: &TransportConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, config.max_frame_size)
    }
}

impl Plugin for FramedPlugin {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.request_tx
                .send(Request { data, reply_tx })
                .map_err(|_| PaymentError::ConnectionClosed)?;
            reply_rx.await.map_err(|_| PaymentError::ConnectionClosed)?
        }
        .boxed()
    }
}

async fn exchange<T>(framed: &mut Framed<T, OerFrameCodec>, data: Bytes) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(data).await?;
    match framed.next().await {
        Some(reply) => reply,
        None => Err(PaymentError::ConnectionClosed),
    }
}

async fn drive<T>(
    mut framed: Framed<T, OerFrameCodec>,
    mut request_rx: mpsc::UnboundedReceiver<Request>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(Request { data, reply_tx }) = request_rx.recv().await {
        let reply = exchange(&mut framed, data).await;
        if reply_tx.send(reply).is_err() {
            debug!("Discarded reply for abandoned request");
        }
    }
    debug!("Framed plugin dropped, closing transport");
}

/// Answer every frame from `io` with `handler` until the peer hangs up
#[instrument(skip(io, handler))]
pub async fn serve_framed<T, H>(io: T, handler: &H, max_frame_size: usize) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    H: DataHandler + ?Sized,
{
    let mut framed = Framed::new(io, OerFrameCodec::new(max_frame_size));
    let mut served = 0u64;

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        debug!(bytes = frame.len(), "Received frame");
        framed.send(handler.handle_data(frame)).await?;
        served += 1;
    }

    info!(frames = served, "Peer closed framed transport");
    Ok(())
}
