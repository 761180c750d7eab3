//! # Congestion Control
//!
//! Discovers the largest amount a path will carry in one packet.
//!
//! The controller keeps a search bracket: `lower_bound` is the largest amount known to
//! succeed and `upper_bound` the smallest amount known to fail. Failures without usable
//! data bisect the bracket. An `F08` rejection that states the path maximum pins the
//! ceiling to that maximum exactly, so the next packet succeeds in one round trip.
//!
//! The state machine is synchronous and owns no I/O; the connection feeds it outcomes.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::cmp::min;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CongestionController {
    lower_bound: BigUint,
    upper_bound: Option<BigUint>,
    /// `upper_bound - 1` is a maximum stated by the path, not a guess
    exact: bool,
}

impl CongestionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a known per-packet maximum
    pub fn with_max_packet_amount(max: impl Into<BigUint>) -> Self {
        let mut controller = Self::new();
        controller.upper_bound = Some(max.into() + 1u8);
        controller.exact = true;
        controller
    }

    /// Largest amount known to have succeeded
    pub fn lower_bound(&self) -> &BigUint {
        &self.lower_bound
    }

    /// Smallest amount known to fail, if any failure has been observed
    pub fn upper_bound(&self) -> Option<&BigUint> {
        self.upper_bound.as_ref()
    }

    /// Largest amount worth attempting next; `None` when unbounded
    pub fn ceiling(&self) -> Option<BigUint> {
        let upper = self.upper_bound.as_ref()?;
        if upper.is_zero() {
            return Some(BigUint::zero());
        }
        if self.exact {
            return Some(upper - 1u8);
        }
        Some((&self.lower_bound + upper - 1u8) / 2u8)
    }

    /// Amount of the next packet given what the streams want to send.
    ///
    /// Returns `None` when the ceiling has collapsed to zero and no value can move.
    pub fn packet_amount(&self, desired: &BigUint) -> Option<BigUint> {
        match self.ceiling() {
            None => Some(desired.clone()),
            Some(ceiling) if ceiling.is_zero() => None,
            Some(ceiling) => Some(min(desired.clone(), ceiling)),
        }
    }

    /// A packet of `amount` was fulfilled
    pub fn on_fulfill(&mut self, amount: &BigUint) {
        if *amount > self.lower_bound {
            self.lower_bound = amount.clone();
            debug!(lower_bound = %self.lower_bound, "Raised packet lower bound");
        }
    }

    /// The path stated its per-packet maximum
    pub fn on_amount_too_large(&mut self, maximum: &BigUint) {
        self.upper_bound = Some(maximum + 1u8);
        self.exact = true;
        if self.lower_bound > *maximum {
            self.lower_bound = maximum.clone();
        }
        debug!(maximum = %maximum, "Path reported maximum packet amount");
    }

    /// A packet of `attempted` failed without telling us why
    pub fn on_capacity_unknown(&mut self, attempted: &BigUint) {
        if attempted.is_zero() {
            return;
        }
        if self.lower_bound >= *attempted {
            self.lower_bound = attempted - BigUint::one();
        }
        self.upper_bound = Some(attempted.clone());
        self.exact = false;
        debug!(
            attempted = %attempted,
            lower_bound = %self.lower_bound,
            "Packet failed, narrowing search"
        );
    }
}
