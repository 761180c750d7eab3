//! Chaos engineering tests
//!
//! Tests connection behavior under adverse path conditions including
//! packet loss, delays, flapping rejections and a peer that goes away.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use num_bigint::BigUint;
use payment_stream::config::ConnectionConfig;
use payment_stream::error::{PaymentError, Result};
use payment_stream::protocol::packet::{Reject, RejectCode, Reply};
use payment_stream::transport::DataHandler;
use payment_stream::{Connection, LoopbackPlugin, Plugin, Role};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::time::timeout;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        retry_delay: Duration::from_millis(1),
        ..ConnectionConfig::default()
    }
}

/// Drops every `every`-th packet with a transport error before it reaches the peer
struct LossyPath {
    inner: LoopbackPlugin,
    every: usize,
    calls: AtomicUsize,
}

impl Plugin for LossyPath {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call % self.every == 0 {
            return async { Err(PaymentError::Transport("packet dropped".to_string())) }.boxed();
        }
        self.inner.send_data(data)
    }

    fn register_data_handler(&self, handler: Weak<dyn DataHandler>) {
        self.inner.register_data_handler(handler)
    }

    fn deregister_data_handler(&self) {
        self.inner.deregister_data_handler()
    }
}

/// Delays every packet by a random few milliseconds
struct JitteryPath {
    inner: LoopbackPlugin,
    rng: Mutex<StdRng>,
}

impl Plugin for JitteryPath {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        let delay = self.rng.lock().unwrap().random_range(0..5u64);
        async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.inner.send_data(data).await
        }
        .boxed()
    }

    fn register_data_handler(&self, handler: Weak<dyn DataHandler>) {
        self.inner.register_data_handler(handler)
    }

    fn deregister_data_handler(&self) {
        self.inner.deregister_data_handler()
    }
}

/// Answers every other packet with a temporary rejection
struct FlappingPath {
    inner: LoopbackPlugin,
    calls: AtomicUsize,
}

impl Plugin for FlappingPath {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call % 2 == 0 {
            let reject = Reject::new(RejectCode::INSUFFICIENT_LIQUIDITY, "Try again");
            let reply = Reply::from(reject).to_bytes().map_err(PaymentError::from);
            return async move { reply }.boxed();
        }
        self.inner.send_data(data)
    }

    fn register_data_handler(&self, handler: Weak<dyn DataHandler>) {
        self.inner.register_data_handler(handler)
    }

    fn deregister_data_handler(&self) {
        self.inner.deregister_data_handler()
    }
}

#[tokio::test]
async fn test_packet_loss_conserves_value() {
    let (client_end, server_end) = LoopbackPlugin::pair();
    client_end.set_max_packet_amount(Some(BigUint::from(100u32)));
    let lossy = LossyPath {
        inner: client_end,
        every: 3,
        calls: AtomicUsize::new(0),
    };
    let client = Connection::open(Role::Client, lossy, fast_config());
    let server = Connection::open(Role::Server, server_end, fast_config());

    let stream = client.create_money_stream().unwrap();
    stream.send(1000u32).unwrap();
    timeout(Duration::from_secs(10), stream.flushed())
        .await
        .expect("flush should finish")
        .unwrap();

    let incoming = server.stream(stream.id()).expect("peer stream");
    assert_eq!(incoming.amount_incoming(), BigUint::from(1000u32));
    assert_eq!(stream.amount_outgoing(), BigUint::from(0u32));
    assert_eq!(stream.amount_held(), BigUint::from(0u32));

    let metrics = client.metrics();
    assert!(metrics.transport_failures >= 1);
    assert_eq!(metrics.terminal_failures, 0);

    // Every loss narrowed the search below the path maximum
    let ceiling = client.congestion().ceiling().expect("bounded");
    assert!(ceiling < BigUint::from(100u32));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_random_delays_preserve_totals() {
    let (client_end, server_end) = LoopbackPlugin::pair();
    client_end.set_max_packet_amount(Some(BigUint::from(40u32)));
    let jittery = JitteryPath {
        inner: client_end,
        rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
    };
    let client = Connection::open(Role::Client, jittery, fast_config());
    let server = Connection::open(Role::Server, server_end, fast_config());

    let streams: Vec<_> = (0..3)
        .map(|_| client.create_money_stream().unwrap())
        .collect();
    for (i, stream) in streams.iter().enumerate() {
        stream.send(BigUint::from(100u32 * (i as u32 + 1))).unwrap();
    }
    for stream in &streams {
        timeout(Duration::from_secs(10), stream.flushed())
            .await
            .expect("flush should finish")
            .unwrap();
    }

    for (i, stream) in streams.iter().enumerate() {
        let incoming = server.stream(stream.id()).expect("peer stream");
        assert_eq!(incoming.amount_incoming(), BigUint::from(100u32 * (i as u32 + 1)));
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_flapping_path_retries_until_delivered() {
    let (client_end, server_end) = LoopbackPlugin::pair();
    client_end.set_max_packet_amount(Some(BigUint::from(25u32)));
    let flapping = FlappingPath {
        inner: client_end,
        calls: AtomicUsize::new(0),
    };
    let client = Connection::open(Role::Client, flapping, fast_config());
    let server = Connection::open(Role::Server, server_end, fast_config());

    let stream = client.create_money_stream().unwrap();
    stream.send(200u32).unwrap();
    timeout(Duration::from_secs(10), stream.flushed())
        .await
        .expect("flush should finish")
        .unwrap();

    assert_eq!(
        server.stream(stream.id()).unwrap().amount_incoming(),
        BigUint::from(200u32)
    );
    let metrics = client.metrics();
    assert!(metrics.temporary_rejections >= 1);
    assert!(stream.failure().is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_peer_going_away_fails_streams_and_returns_value() {
    let (client_end, server_end) = LoopbackPlugin::pair();
    let client = Connection::open(Role::Client, client_end, fast_config());
    let server = Connection::open(Role::Server, server_end, fast_config());
    server.close().await;

    let stream = client.create_money_stream().unwrap();
    stream.send(100u32).unwrap();
    let result = timeout(Duration::from_secs(5), stream.flushed())
        .await
        .expect("flush should finish");

    assert!(matches!(result, Err(PaymentError::StreamFailed { .. })));
    assert_eq!(stream.amount_outgoing(), BigUint::from(100u32));
    assert_eq!(stream.amount_held(), BigUint::from(0u32));

    client.close().await;
}
