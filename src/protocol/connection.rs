//! # Connection
//!
//! Multiplexes money streams over one plugin and discovers how much a packet can carry.
//!
//! ## Send Loop
//! A single task per connection runs strictly one packet at a time:
//!
//! 1. Sum the sendable balance of every stream and cap it with the congestion ceiling
//! 2. Place holds on the streams in id order until the packet amount is covered
//! 3. Encode a Prepare whose amount equals the sum of the holds and hand it to the plugin
//! 4. Execute the holds on Fulfill, cancel them on anything else
//!
//! Capacity rejections (`F08`, transport errors, timeouts) feed the
//! [`CongestionController`]. Other rejections fail the streams in the packet without
//! touching the search bracket. When the ceiling reaches zero every stream with value
//! queued fails and its [`flushed`](MoneyStream::flushed) call returns an error.
//!
//! ## Receive Path
//! Prepares from the peer arrive through [`DataHandler::handle_data`]. The received
//! amount is split across the money frames in proportion to their shares, because the
//! path may have converted the amount on the way.

use crate::config::ConnectionConfig;
use crate::error::{constants, OerError, PaymentError, Result};
use crate::protocol::congestion::CongestionController;
use crate::protocol::money_stream::{HoldId, MoneyStream};
use crate::protocol::packet::{
    AmountTooLarge, Frame, Fulfill, Prepare, Reject, RejectCode, Reply, StreamPacket,
};
use crate::transport::{DataHandler, Plugin};
use crate::utils::lock;
use crate::utils::metrics::{Metrics, MetricsSnapshot, Timer};
use crate::utils::timeout::with_timeout;
use bytes::Bytes;
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Which end of the connection this is; decides stream id parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream ids
    Client,
    /// Opens even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u64 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

struct StreamEntry {
    stream: MoneyStream,
    close_sent: bool,
}

/// Packet being assembled or awaiting its reply
struct PacketPlan {
    sequence: HoldId,
    amount: BigUint,
    /// Streams in the packet with the amount held on each
    held: Vec<(MoneyStream, BigUint)>,
    closes: Vec<u64>,
}

enum Outcome {
    Fulfilled,
    Rejected(Reject),
    Failed(PaymentError),
}

enum Step {
    Continue,
    Idle,
}

struct Inner {
    role: Role,
    config: ConnectionConfig,
    streams: Mutex<BTreeMap<u64, StreamEntry>>,
    next_stream_id: AtomicU64,
    next_sequence: AtomicU64,
    congestion: Mutex<CongestionController>,
    wake: Arc<Notify>,
    closed: AtomicBool,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<MoneyStream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MoneyStream>>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

/// Cloneable handle to a running connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Register with `plugin` and start the send loop.
    ///
    /// Must be called from within a Tokio runtime. The loop runs until [`close`](Self::close).
    pub fn open<P: Plugin>(role: Role, plugin: P, config: ConnectionConfig) -> Self {
        let congestion = match config.initial_max_packet_amount {
            Some(max) => CongestionController::with_max_packet_amount(max),
            None => CongestionController::new(),
        };
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            role,
            config,
            streams: Mutex::new(BTreeMap::new()),
            next_stream_id: AtomicU64::new(role.first_stream_id()),
            next_sequence: AtomicU64::new(1),
            congestion: Mutex::new(congestion),
            wake: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            task: Mutex::new(None),
            metrics: Metrics::new(),
        });

        let handler: Arc<dyn DataHandler> = inner.clone();
        plugin.register_data_handler(Arc::downgrade(&handler));

        let task = tokio::spawn(inner.clone().run(plugin));
        *lock(&inner.task) = Some(task);
        info!(role = ?role, "Connection opened");

        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Open a new stream towards the peer
    pub fn create_money_stream(&self) -> Result<MoneyStream> {
        if self.is_closed() {
            return Err(PaymentError::ConnectionClosed);
        }
        let id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = MoneyStream::new(id, self.inner.wake.clone());
        self.inner.streams().insert(
            id,
            StreamEntry {
                stream: stream.clone(),
                close_sent: false,
            },
        );
        self.inner.metrics.stream_opened();
        debug!(stream_id = id, "Created money stream");
        Ok(stream)
    }

    /// Next stream opened by the peer; `None` once the connection is closed
    pub async fn accept_stream(&self) -> Option<MoneyStream> {
        self.inner.accept_rx.lock().await.recv().await
    }

    pub fn stream(&self, id: u64) -> Option<MoneyStream> {
        self.inner.streams().get(&id).map(|entry| entry.stream.clone())
    }

    /// Every stream known to the connection, in id order
    pub fn streams(&self) -> Vec<MoneyStream> {
        self.inner
            .streams()
            .values()
            .map(|entry| entry.stream.clone())
            .collect()
    }

    /// Current state of the packet amount search
    pub fn congestion(&self) -> CongestionController {
        self.inner.congestion().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop the send loop and close every stream.
    ///
    /// A packet already in flight resolves first. Streams with value still queued fail
    /// with [`PaymentError::ConnectionClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(role = ?self.inner.role, "Closing connection");
        self.inner.wake.notify_one();
        lock(&self.inner.accept_tx).take();

        for stream in self.streams() {
            stream.close();
            if !stream.amount_outgoing().is_zero() || !stream.amount_held().is_zero() {
                stream.fail_connection_closed();
            }
        }

        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Send loop ended abnormally");
            }
        }
        self.inner.metrics.log_metrics();
    }
}

impl DataHandler for Connection {
    fn handle_data(&self, data: Bytes) -> Bytes {
        self.inner.handle_data(data)
    }
}

impl Inner {
    fn streams(&self) -> MutexGuard<'_, BTreeMap<u64, StreamEntry>> {
        lock(&self.streams)
    }

    fn congestion(&self) -> MutexGuard<'_, CongestionController> {
        lock(&self.congestion)
    }

    async fn run<P: Plugin>(self: Arc<Self>, plugin: P) {
        let mut temporary_failures = 0u32;
        while !self.closed.load(Ordering::Acquire) {
            match self.send_next_packet(&plugin, &mut temporary_failures).await {
                Step::Continue => {}
                Step::Idle => self.wake.notified().await,
            }
        }
        plugin.deregister_data_handler();
        debug!(role = ?self.role, "Send loop stopped");
    }

    /// Streams with value to send, in id order
    fn sendable_streams(&self) -> Vec<(MoneyStream, BigUint)> {
        self.streams()
            .values()
            .filter_map(|entry| {
                let sendable = entry.stream.sendable();
                (!sendable.is_zero()).then(|| (entry.stream.clone(), sendable))
            })
            .collect()
    }

    /// Closed streams that have drained and still owe the peer a close frame
    fn pending_closes(&self) -> Vec<u64> {
        self.streams()
            .iter()
            .filter(|(_, entry)| !entry.close_sent && entry.stream.is_drained_and_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    fn mark_closes_sent(&self, ids: &[u64]) {
        let mut streams = self.streams();
        for id in ids {
            if let Some(entry) = streams.get_mut(id) {
                if !entry.close_sent {
                    entry.close_sent = true;
                    self.metrics.stream_closed();
                }
            }
        }
    }

    #[instrument(skip(self, plugin, temporary_failures), fields(role = ?self.role))]
    async fn send_next_packet<P: Plugin>(&self, plugin: &P, temporary_failures: &mut u32) -> Step {
        let candidates = self.sendable_streams();
        let desired: BigUint = candidates.iter().map(|(_, amount)| amount).sum();
        let closes = self.pending_closes();
        if desired.is_zero() && closes.is_empty() {
            return Step::Idle;
        }

        let amount = if desired.is_zero() {
            BigUint::zero()
        } else {
            let next = self.congestion().packet_amount(&desired);
            match next {
                Some(amount) => amount,
                None => {
                    self.fail_terminal(&candidates);
                    return Step::Continue;
                }
            }
        };

        let plan = self.reserve(&candidates, amount, closes);
        if plan.amount.is_zero() && plan.closes.is_empty() {
            return Step::Continue;
        }

        let prepare = match self.encode(&plan) {
            Ok(prepare) => prepare,
            Err(e) => {
                error!(error = %e, sequence = plan.sequence, "Failed to encode packet");
                self.cancel_holds(&plan);
                self.fail_streams(&plan, &e.to_string());
                self.mark_closes_sent(&plan.closes);
                return Step::Continue;
            }
        };

        let outcome = self.transmit(plugin, prepare).await;
        self.settle(outcome, &plan, temporary_failures).await
    }

    fn reserve(
        &self,
        candidates: &[(MoneyStream, BigUint)],
        amount: BigUint,
        closes: Vec<u64>,
    ) -> PacketPlan {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut remaining = amount.clone();
        let mut held = Vec::new();

        for (stream, _) in candidates {
            if remaining.is_zero() {
                break;
            }
            let share = stream.hold_outgoing(sequence, Some(&remaining));
            if !share.is_zero() {
                remaining -= &share;
                held.push((stream.clone(), share));
            }
        }

        PacketPlan {
            sequence,
            amount: amount - remaining,
            held,
            closes,
        }
    }

    fn encode(&self, plan: &PacketPlan) -> std::result::Result<Bytes, OerError> {
        let mut frames: Vec<Frame> = plan
            .held
            .iter()
            .map(|(stream, shares)| Frame::Money {
                stream_id: stream.id(),
                shares: shares.clone(),
            })
            .collect();
        frames.extend(
            plan.closes
                .iter()
                .map(|&stream_id| Frame::StreamClose { stream_id }),
        );

        let data = StreamPacket {
            sequence: plan.sequence,
            frames,
        }
        .to_bytes()?;
        Prepare {
            amount: plan.amount.clone(),
            data,
        }
        .to_bytes()
    }

    async fn transmit<P: Plugin>(&self, plugin: &P, prepare: Bytes) -> Outcome {
        let _timer = Timer::start("packet_round_trip");
        self.metrics.packet_sent(prepare.len() as u64);

        match with_timeout(self.config.packet_timeout, plugin.send_data(prepare)).await {
            Ok(reply) => match Reply::from_bytes(reply) {
                Ok(Reply::Fulfill(_)) => Outcome::Fulfilled,
                Ok(Reply::Reject(reject)) => Outcome::Rejected(reject),
                Err(e) => Outcome::Failed(e.into()),
            },
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn settle(&self, outcome: Outcome, plan: &PacketPlan, temporary_failures: &mut u32) -> Step {
        match outcome {
            Outcome::Fulfilled => {
                for (stream, _) in &plan.held {
                    stream.execute_hold(plan.sequence);
                }
                if !plan.amount.is_zero() {
                    self.congestion().on_fulfill(&plan.amount);
                }
                self.mark_closes_sent(&plan.closes);
                *temporary_failures = 0;
                self.metrics.packet_fulfilled();
                debug!(sequence = plan.sequence, amount = %plan.amount, "Packet fulfilled");
            }
            Outcome::Rejected(reject) => {
                self.metrics.packet_rejected();
                self.cancel_holds(plan);

                if reject.code.is_amount_too_large() && !plan.amount.is_zero() {
                    self.record_amount_too_large(&reject, &plan.amount);
                } else if reject.code.is_temporary() {
                    self.metrics.temporary_rejection();
                    let reason = format!("{}: {}", reject.code, reject.message);
                    return self.retry_or_fail(plan, reason, temporary_failures).await;
                } else {
                    warn!(
                        sequence = plan.sequence,
                        code = %reject.code,
                        message = %reject.message,
                        "Packet rejected"
                    );
                    let reason = PaymentError::Rejected {
                        code: reject.code.to_string(),
                        message: reject.message,
                    };
                    self.fail_streams(plan, &reason.to_string());
                    self.mark_closes_sent(&plan.closes);
                    *temporary_failures = 0;
                }
            }
            Outcome::Failed(e) => {
                self.cancel_holds(plan);
                if matches!(e, PaymentError::Timeout) {
                    self.metrics.timeout();
                } else {
                    self.metrics.transport_failure();
                }

                if plan.amount.is_zero() {
                    return self.retry_or_fail(plan, e.to_string(), temporary_failures).await;
                }
                warn!(
                    sequence = plan.sequence,
                    amount = %plan.amount,
                    error = %e,
                    "Packet failed"
                );
                self.metrics.capacity_rejection();
                self.congestion().on_capacity_unknown(&plan.amount);
            }
        }
        Step::Continue
    }

    fn record_amount_too_large(&self, reject: &Reject, attempted: &BigUint) {
        self.metrics.capacity_rejection();
        let details = AmountTooLarge::from_bytes(reject.data.clone());
        let mut congestion = self.congestion();
        match details {
            Ok(details) if details.is_sensible() => {
                warn!(
                    attempted = %attempted,
                    maximum = %details.maximum_amount,
                    "Packet amount too large"
                );
                congestion.on_amount_too_large(&details.maximum_amount);
            }
            _ => {
                warn!(attempted = %attempted, "Packet amount too large, no usable maximum");
                congestion.on_capacity_unknown(attempted);
            }
        }
    }

    async fn retry_or_fail(&self, plan: &PacketPlan, reason: String, temporary_failures: &mut u32) -> Step {
        *temporary_failures += 1;
        if *temporary_failures > self.config.max_temporary_retries {
            warn!(
                attempts = *temporary_failures,
                reason = %reason,
                "Giving up after repeated temporary failures"
            );
            *temporary_failures = 0;
            self.fail_streams(plan, &reason);
            self.mark_closes_sent(&plan.closes);
        } else {
            debug!(
                attempt = *temporary_failures,
                reason = %reason,
                "Temporary failure, retrying"
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
        Step::Continue
    }

    fn cancel_holds(&self, plan: &PacketPlan) {
        for (stream, _) in &plan.held {
            stream.cancel_hold(plan.sequence);
        }
    }

    fn fail_streams(&self, plan: &PacketPlan, reason: &str) {
        for (stream, _) in &plan.held {
            stream.fail(reason);
        }
    }

    fn fail_terminal(&self, candidates: &[(MoneyStream, BigUint)]) {
        warn!(
            streams = candidates.len(),
            "{}",
            constants::ERR_PACKET_AMOUNT_TOO_SMALL
        );
        self.metrics.terminal_failure();
        for (stream, _) in candidates {
            stream.fail(constants::ERR_PACKET_AMOUNT_TOO_SMALL);
        }
    }

    fn stream_or_accept(&self, streams: &mut BTreeMap<u64, StreamEntry>, id: u64) -> MoneyStream {
        if let Some(entry) = streams.get(&id) {
            return entry.stream.clone();
        }
        let stream = MoneyStream::new(id, self.wake.clone());
        streams.insert(
            id,
            StreamEntry {
                stream: stream.clone(),
                close_sent: false,
            },
        );
        self.metrics.stream_opened();
        info!(stream_id = id, "Peer opened stream");
        if let Some(tx) = lock(&self.accept_tx).as_ref() {
            // Nobody accepting is fine; the stream stays reachable by id
            let _ = tx.send(stream.clone());
        }
        stream
    }

    fn handle_prepare(&self, data: Bytes) -> Reply {
        self.metrics.packet_received(data.len() as u64);
        if self.closed.load(Ordering::Acquire) {
            return Reject::new(RejectCode::APPLICATION_ERROR, constants::ERR_CONNECTION_CLOSED)
                .into();
        }

        let decoded = Prepare::from_bytes(data).and_then(|prepare| {
            let packet = StreamPacket::from_bytes(prepare.data.clone())?;
            Ok((prepare, packet))
        });
        let (prepare, packet) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                return Reject::new(RejectCode::UNEXPECTED_PAYMENT, e.to_string()).into();
            }
        };

        let total_shares = packet.total_shares();
        if total_shares.is_zero() && !prepare.amount.is_zero() {
            return Reject::new(RejectCode::APPLICATION_ERROR, "Packet carries no money frames")
                .into();
        }

        let mut credits = Vec::new();
        {
            let mut streams = self.streams();
            // Refuse before opening anything so a rejected packet leaves no trace
            for frame in &packet.frames {
                if let Frame::Money { stream_id, .. } = frame {
                    if streams
                        .get(stream_id)
                        .is_some_and(|entry| entry.stream.is_closed())
                    {
                        return Reject::new(
                            RejectCode::APPLICATION_ERROR,
                            format!("Stream {stream_id} is closed"),
                        )
                        .into();
                    }
                }
            }
            for frame in &packet.frames {
                if let Frame::Money { stream_id, shares } = frame {
                    let stream = self.stream_or_accept(&mut streams, *stream_id);
                    credits.push((stream, shares));
                }
            }
        }

        if !total_shares.is_zero() {
            for (stream, shares) in credits {
                let credit = &prepare.amount * shares / &total_shares;
                if !credit.is_zero() {
                    stream.add_to_incoming(&credit);
                }
            }
        }

        for frame in &packet.frames {
            if let Frame::StreamClose { stream_id } = frame {
                let stream = {
                    let mut streams = self.streams();
                    streams.get_mut(stream_id).and_then(|entry| {
                        if entry.close_sent {
                            return None;
                        }
                        entry.close_sent = true;
                        Some(entry.stream.clone())
                    })
                };
                if let Some(stream) = stream {
                    debug!(stream_id, "Peer closed stream");
                    self.metrics.stream_closed();
                    stream.close();
                }
            }
        }

        Reply::Fulfill(Fulfill::default())
    }
}

impl DataHandler for Inner {
    fn handle_data(&self, data: Bytes) -> Bytes {
        let reply = self.handle_prepare(data);
        if let Reply::Reject(reject) = &reply {
            debug!(code = %reject.code, message = %reject.message, "Refused incoming packet");
        }
        match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode reply");
                Bytes::new()
            }
        }
    }
}
