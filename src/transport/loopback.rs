//! # Loopback Plugin
//!
//! Two mirrored in-process plugins. Whatever one side sends is handed to the data handler
//! registered on the other side, after passing through a simulated connector that can:
//!
//! - refuse packets above a maximum amount with `F08` and [`AmountTooLarge`] data
//! - apply an exact exchange rate (`amount * numerator / denominator`, rounded down)
//! - record the amount of every Prepare it saw
//!
//! Without a registered handler on the far side, packets are rejected with `F02`.

use crate::config::TransportConfig;
use crate::error::{constants, Result};
use crate::protocol::packet::{AmountTooLarge, Prepare, Reject, RejectCode, Reply};
use crate::transport::{DataHandler, Plugin};
use crate::utils::lock;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use num_bigint::BigUint;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[derive(Default)]
struct HandlerSlot(Mutex<Option<Weak<dyn DataHandler>>>);

impl HandlerSlot {
    fn get(&self) -> Option<Arc<dyn DataHandler>> {
        lock(&self.0).as_ref().and_then(Weak::upgrade)
    }
}

/// One end of an in-process connector path
pub struct LoopbackPlugin {
    local: Arc<HandlerSlot>,
    remote: Arc<HandlerSlot>,
    numerator: BigUint,
    denominator: BigUint,
    max_packet_amount: Mutex<Option<BigUint>>,
    history: Mutex<Vec<BigUint>>,
}

impl LoopbackPlugin {
    /// Connected pair with a 1:1 exchange rate
    pub fn pair() -> (Self, Self) {
        Self::pair_with_rate(1, 1)
    }

    /// Connected pair converting amounts at `numerator / denominator` in both directions.
    ///
    /// A zero denominator is treated as 1.
    pub fn pair_with_rate(numerator: u64, denominator: u64) -> (Self, Self) {
        let a = Arc::new(HandlerSlot::default());
        let b = Arc::new(HandlerSlot::default());
        let end = |local: &Arc<HandlerSlot>, remote: &Arc<HandlerSlot>| Self {
            local: local.clone(),
            remote: remote.clone(),
            numerator: BigUint::from(numerator),
            denominator: BigUint::from(denominator.max(1)),
            max_packet_amount: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        };
        (end(&a, &b), end(&b, &a))
    }

    /// Connected pair using the configured exchange rate
    pub fn pair_from_config(config: &TransportConfig) -> (Self, Self) {
        Self::pair_with_rate(
            config.exchange_rate_numerator,
            config.exchange_rate_denominator,
        )
    }

    /// Refuse packets above `max` with `F08`; `None` lifts the limit
    pub fn set_max_packet_amount(&self, max: Option<BigUint>) {
        *lock(&self.max_packet_amount) = max;
    }

    /// Amounts of every Prepare sent through this end, in order
    pub fn history(&self) -> Vec<BigUint> {
        lock(&self.history).clone()
    }

    fn forward(&self, data: Bytes) -> Result<Bytes> {
        let prepare = Prepare::from_bytes(data)?;
        lock(&self.history).push(prepare.amount.clone());

        let max = lock(&self.max_packet_amount).clone();
        if let Some(max) = max {
            if prepare.amount > max {
                debug!(amount = %prepare.amount, maximum = %max, "Loopback refused packet");
                let details = AmountTooLarge {
                    received_amount: prepare.amount,
                    maximum_amount: max,
                };
                let reject = Reject::new(RejectCode::AMOUNT_TOO_LARGE, "Amount too large")
                    .with_data(details.to_bytes()?);
                return Ok(Reply::from(reject).to_bytes()?);
            }
        }

        let Some(handler) = self.remote.get() else {
            let reject = Reject::new(RejectCode::UNREACHABLE, constants::ERR_NO_DATA_HANDLER);
            return Ok(Reply::from(reject).to_bytes()?);
        };

        let forwarded = Prepare {
            amount: prepare.amount * &self.numerator / &self.denominator,
            data: prepare.data,
        };
        Ok(handler.handle_data(forwarded.to_bytes()?))
    }
}

impl Plugin for LoopbackPlugin {
    fn send_data(&self, data: Bytes) -> BoxFuture<'_, Result<Bytes>> {
        async move {
            // Let the other side run between packets
            tokio::task::yield_now().await;
            self.forward(data)
        }
        .boxed()
    }

    fn register_data_handler(&self, handler: Weak<dyn DataHandler>) {
        *lock(&self.local.0) = Some(handler);
    }

    fn deregister_data_handler(&self) {
        *lock(&self.local.0) = None;
    }
}
