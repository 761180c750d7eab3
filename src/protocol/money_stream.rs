//! # Money Stream
//!
//! Ledger for one logical payment channel inside a connection.
//!
//! A stream tracks value the application wants to send (`amount_outgoing`), value the peer
//! has delivered (`amount_incoming`) and named holds placed by the connection while a
//! packet is in flight. Holds are the reservation half of a two-phase commit: a hold is
//! either executed (the money left) or cancelled (the money returns to
//! `amount_outgoing`), and both operations are idempotent.
//!
//! ## Notifications
//! - [`MoneyStream::events`] yields [`StreamEvent`]s for every ledger movement
//! - [`MoneyStream::flushed`] waits on a change counter, so dropping the future leaves
//!   nothing registered behind
//!
//! ## Example
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> payment_stream::error::Result<()> {
//! use payment_stream::protocol::money_stream::MoneyStream;
//! use num_bigint::BigUint;
//!
//! let stream = MoneyStream::detached(1);
//! stream.send(100u32)?;
//! let held = stream.hold_outgoing(1, Some(&BigUint::from(60u32)));
//! assert_eq!(held, BigUint::from(60u32));
//! stream.execute_hold(1);
//! stream.receive(Some(BigUint::from(40u32)))?;
//! stream.flushed().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{constants, PaymentError, Result};
use crate::utils::lock;
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Identifier of a hold; the connection uses the packet sequence number
pub type HoldId = u64;

const EVENT_CAPACITY: usize = 64;

/// Ledger movement reported to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Value delivered by the peer
    Incoming(BigUint),
    /// Value that left the ledger in a fulfilled packet
    Outgoing(BigUint),
    Closed,
    /// Sending stopped; the payload is the reason
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamFailure {
    ConnectionClosed,
    Failed(String),
}

#[derive(Debug, Default)]
struct Ledger {
    amount_incoming: BigUint,
    amount_outgoing: BigUint,
    holds: HashMap<HoldId, BigUint>,
    closed: bool,
    failure: Option<StreamFailure>,
}

#[derive(Debug)]
struct Shared {
    id: u64,
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<StreamEvent>,
    version: watch::Sender<u64>,
    wake: Arc<Notify>,
}

/// Cloneable handle to a stream ledger
#[derive(Debug, Clone)]
pub struct MoneyStream {
    shared: Arc<Shared>,
}

impl MoneyStream {
    pub(crate) fn new(id: u64, wake: Arc<Notify>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                id,
                ledger: Mutex::new(Ledger::default()),
                events,
                version,
                wake,
            }),
        }
    }

    /// Stream not attached to any connection, driven by hand
    pub fn detached(id: u64) -> Self {
        Self::new(id, Arc::new(Notify::new()))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn amount_incoming(&self) -> BigUint {
        self.ledger().amount_incoming.clone()
    }

    pub fn amount_outgoing(&self) -> BigUint {
        self.ledger().amount_outgoing.clone()
    }

    /// Total value currently reserved by in-flight packets
    pub fn amount_held(&self) -> BigUint {
        self.ledger().holds.values().sum()
    }

    pub fn is_closed(&self) -> bool {
        self.ledger().closed
    }

    /// Reason the stream stopped sending, cleared by the next [`send`](Self::send)
    pub fn failure(&self) -> Option<String> {
        self.ledger().failure.as_ref().map(|failure| match failure {
            StreamFailure::ConnectionClosed => constants::ERR_CONNECTION_CLOSED.to_string(),
            StreamFailure::Failed(reason) => reason.clone(),
        })
    }

    /// Queue `amount` for delivery to the peer
    pub fn send(&self, amount: impl Into<BigUint>) -> Result<()> {
        let amount = amount.into();
        {
            let mut ledger = self.ledger();
            if ledger.closed {
                return Err(PaymentError::ClosedStream(self.shared.id));
            }
            if ledger.failure == Some(StreamFailure::ConnectionClosed) {
                return Err(PaymentError::ConnectionClosed);
            }
            ledger.amount_outgoing += &amount;
            ledger.failure = None;
            debug!(
                stream_id = self.shared.id,
                amount = %amount,
                outgoing = %ledger.amount_outgoing,
                "Queued outgoing amount"
            );
        }
        self.bump();
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Withdraw `amount` (default: all incoming) from incoming, then from unsent outgoing
    pub fn receive(&self, amount: Option<BigUint>) -> Result<BigUint> {
        let requested = {
            let mut ledger = self.ledger();
            let requested = amount.unwrap_or_else(|| ledger.amount_incoming.clone());
            let available = &ledger.amount_incoming + &ledger.amount_outgoing;
            if requested > available {
                return Err(PaymentError::InsufficientFunds {
                    requested,
                    available,
                });
            }

            if requested <= ledger.amount_incoming {
                ledger.amount_incoming -= &requested;
            } else {
                let shortfall = &requested - &ledger.amount_incoming;
                ledger.amount_incoming.set_zero();
                ledger.amount_outgoing -= shortfall;
            }
            debug!(
                stream_id = self.shared.id,
                amount = %requested,
                incoming = %ledger.amount_incoming,
                outgoing = %ledger.amount_outgoing,
                "Received from stream"
            );
            requested
        };
        self.bump();
        Ok(requested)
    }

    /// Wait until nothing is left to send and no hold is outstanding.
    ///
    /// Fails if the stream is failed while value is still queued.
    pub async fn flushed(&self) -> Result<()> {
        let mut changes = self.shared.version.subscribe();
        loop {
            {
                let ledger = self.ledger();
                if ledger.amount_outgoing.is_zero() && ledger.holds.is_empty() {
                    return Ok(());
                }
                match &ledger.failure {
                    Some(StreamFailure::ConnectionClosed) => {
                        return Err(PaymentError::ConnectionClosed)
                    }
                    Some(StreamFailure::Failed(reason)) => {
                        return Err(PaymentError::StreamFailed {
                            stream_id: self.shared.id,
                            reason: reason.clone(),
                        })
                    }
                    None => {}
                }
            }
            if changes.changed().await.is_err() {
                return Err(PaymentError::ConnectionClosed);
            }
        }
    }

    /// Refuse further sends. Value already queued still drains.
    pub fn close(&self) {
        {
            let mut ledger = self.ledger();
            if ledger.closed {
                return;
            }
            ledger.closed = true;
        }
        debug!(stream_id = self.shared.id, "Stream closed");
        self.emit(StreamEvent::Closed);
        self.bump();
        self.shared.wake.notify_one();
    }

    /// Subscribe to ledger events
    pub fn events(&self) -> BroadcastStream<StreamEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Credit value confirmed by the peer
    pub fn add_to_incoming(&self, amount: &BigUint) {
        {
            let mut ledger = self.ledger();
            ledger.amount_incoming += amount;
            debug!(
                stream_id = self.shared.id,
                amount = %amount,
                incoming = %ledger.amount_incoming,
                "Credited incoming amount"
            );
        }
        self.emit(StreamEvent::Incoming(amount.clone()));
        self.bump();
    }

    /// Move up to `max_amount` (or everything) from outgoing into hold `hold_id`.
    ///
    /// Returns the amount actually held, zero when nothing is available.
    pub fn hold_outgoing(&self, hold_id: HoldId, max_amount: Option<&BigUint>) -> BigUint {
        let mut ledger = self.ledger();
        let amount = match max_amount {
            Some(max) if *max < ledger.amount_outgoing => max.clone(),
            _ => ledger.amount_outgoing.clone(),
        };
        if amount.is_zero() {
            return amount;
        }
        ledger.amount_outgoing -= &amount;
        *ledger.holds.entry(hold_id).or_default() += &amount;
        debug!(
            stream_id = self.shared.id,
            hold_id,
            amount = %amount,
            "Placed hold"
        );
        amount
    }

    /// Commit a hold: its value has left the ledger. Unknown ids are ignored.
    pub fn execute_hold(&self, hold_id: HoldId) {
        let Some(amount) = self.ledger().holds.remove(&hold_id) else {
            return;
        };
        debug!(
            stream_id = self.shared.id,
            hold_id,
            amount = %amount,
            "Executed hold"
        );
        self.emit(StreamEvent::Outgoing(amount));
        self.bump();
    }

    /// Return a hold to the outgoing balance. Unknown ids are ignored.
    pub fn cancel_hold(&self, hold_id: HoldId) {
        {
            let mut ledger = self.ledger();
            let Some(amount) = ledger.holds.remove(&hold_id) else {
                return;
            };
            ledger.amount_outgoing += &amount;
            debug!(
                stream_id = self.shared.id,
                hold_id,
                amount = %amount,
                "Cancelled hold"
            );
        }
        self.bump();
    }

    /// Stop sending and fail pending [`flushed`](Self::flushed) calls
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.ledger().failure = Some(StreamFailure::Failed(reason.clone()));
        debug!(stream_id = self.shared.id, reason = %reason, "Stream failed");
        self.emit(StreamEvent::Error(reason));
        self.bump();
    }

    pub(crate) fn fail_connection_closed(&self) {
        self.ledger().failure = Some(StreamFailure::ConnectionClosed);
        self.emit(StreamEvent::Error(constants::ERR_CONNECTION_CLOSED.to_string()));
        self.bump();
    }

    /// Outgoing balance the connection may pick up right now
    pub(crate) fn sendable(&self) -> BigUint {
        let ledger = self.ledger();
        if ledger.failure.is_some() {
            BigUint::zero()
        } else {
            ledger.amount_outgoing.clone()
        }
    }

    /// Closed with nothing queued or held
    pub(crate) fn is_drained_and_closed(&self) -> bool {
        let ledger = self.ledger();
        ledger.closed && ledger.amount_outgoing.is_zero() && ledger.holds.is_empty()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        lock(&self.shared.ledger)
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn bump(&self) {
        self.shared.version.send_modify(|version| *version += 1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::time::Duration;

    fn big(value: u64) -> BigUint {
        BigUint::from(value)
    }

    #[test]
    fn test_send_accumulates_outgoing() {
        let stream = MoneyStream::detached(1);
        stream.send(100u32).unwrap();
        stream.send(50u32).unwrap();
        assert_eq!(stream.amount_outgoing(), big(150));
        assert_eq!(stream.amount_incoming(), big(0));
    }

    #[test]
    fn test_send_after_close_fails() {
        let stream = MoneyStream::detached(3);
        stream.close();
        assert!(stream.is_closed());
        assert!(matches!(
            stream.send(1u32),
            Err(PaymentError::ClosedStream(3))
        ));
    }

    #[test]
    fn test_receive_draws_incoming_then_outgoing() {
        let stream = MoneyStream::detached(1);
        stream.add_to_incoming(&big(30));
        stream.send(50u32).unwrap();

        assert_eq!(stream.receive(Some(big(40))).unwrap(), big(40));
        assert_eq!(stream.amount_incoming(), big(0));
        assert_eq!(stream.amount_outgoing(), big(40));
    }

    #[test]
    fn test_receive_without_amount_takes_all_incoming() {
        let stream = MoneyStream::detached(1);
        stream.add_to_incoming(&big(25));
        stream.send(10u32).unwrap();
        assert_eq!(stream.receive(None).unwrap(), big(25));
        assert_eq!(stream.amount_outgoing(), big(10));
    }

    #[test]
    fn test_receive_more_than_available_fails() {
        let stream = MoneyStream::detached(1);
        stream.add_to_incoming(&big(5));
        stream.send(5u32).unwrap();
        match stream.receive(Some(big(11))) {
            Err(PaymentError::InsufficientFunds {
                requested,
                available,
            }) => {
                assert_eq!(requested, big(11));
                assert_eq!(available, big(10));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(stream.amount_incoming(), big(5));
    }

    #[test]
    fn test_hold_is_capped_by_outgoing() {
        let stream = MoneyStream::detached(1);
        stream.send(70u32).unwrap();
        assert_eq!(stream.hold_outgoing(1, Some(&big(100))), big(70));
        assert_eq!(stream.amount_outgoing(), big(0));
        assert_eq!(stream.amount_held(), big(70));
        assert_eq!(stream.hold_outgoing(2, None), big(0));
    }

    #[test]
    fn test_cancel_restores_and_is_idempotent() {
        let stream = MoneyStream::detached(1);
        stream.send(100u32).unwrap();
        stream.hold_outgoing(9, Some(&big(60)));
        stream.cancel_hold(9);
        stream.cancel_hold(9);
        stream.execute_hold(9);
        assert_eq!(stream.amount_outgoing(), big(100));
        assert_eq!(stream.amount_held(), big(0));
    }

    #[test]
    fn test_execute_reports_outgoing_event() {
        let stream = MoneyStream::detached(1);
        let mut events = stream.subscribe();
        stream.send(100u32).unwrap();
        stream.hold_outgoing(4, None);
        stream.execute_hold(4);
        stream.execute_hold(4);
        stream.cancel_hold(4);

        assert_eq!(events.try_recv().unwrap(), StreamEvent::Outgoing(big(100)));
        assert!(events.try_recv().is_err());
        assert_eq!(stream.amount_outgoing(), big(0));
    }

    #[tokio::test]
    async fn test_flushed_waits_for_hold_execution() {
        let stream = MoneyStream::detached(1);
        stream.send(10u32).unwrap();
        stream.hold_outgoing(1, None);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.flushed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        stream.execute_hold(1);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_flushed_rejects_on_failure_and_send_clears_it() {
        let stream = MoneyStream::detached(5);
        stream.send(10u32).unwrap();
        stream.fail("path refused");

        match stream.flushed().await {
            Err(PaymentError::StreamFailed { stream_id, reason }) => {
                assert_eq!(stream_id, 5);
                assert_eq!(reason, "path refused");
            }
            other => panic!("unexpected: {other:?}"),
        }

        stream.send(1u32).unwrap();
        assert!(stream.failure().is_none());
        assert_eq!(stream.sendable(), big(11));
    }

    #[tokio::test]
    async fn test_dropped_flushed_future_leaves_stream_usable() {
        let stream = MoneyStream::detached(1);
        stream.send(10u32).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(5), stream.flushed()).await;
        assert!(result.is_err());

        stream.receive(Some(big(10))).unwrap();
        stream.flushed().await.unwrap();
    }
}
