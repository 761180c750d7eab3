//! Property-based tests using proptest
//!
//! These tests validate codec, ledger and congestion invariants across a wide range of
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use num_bigint::BigUint;
use num_traits::Zero;
use payment_stream::core::reader::Reader;
use payment_stream::core::writer::{OerWrite, Writer};
use payment_stream::error::OerError;
use payment_stream::protocol::congestion::CongestionController;
use payment_stream::protocol::money_stream::MoneyStream;
use proptest::prelude::*;

fn encoded(f: impl FnOnce(&mut Writer)) -> Vec<u8> {
    let mut writer = Writer::new();
    f(&mut writer);
    writer.into_bytes().to_vec()
}

// Property: fixed-width unsigned integers survive every width they fit in
proptest! {
    #[test]
    fn prop_fixed_uint_roundtrip(raw in any::<u64>(), width in 1usize..=8) {
        let value = if width == 8 { raw } else { raw & ((1u64 << (8 * width)) - 1) };
        let bytes = encoded(|w| w.write_uint(value, width).unwrap());
        prop_assert_eq!(bytes.len(), width);
        prop_assert_eq!(Reader::new(bytes).read_uint(width).unwrap(), value);
    }
}

// Property: fixed-width signed integers survive every width they fit in
proptest! {
    #[test]
    fn prop_fixed_int_roundtrip(raw in any::<i64>(), width in 1usize..=8) {
        let value = raw >> (64 - 8 * width);
        let bytes = encoded(|w| w.write_int(value, width).unwrap());
        prop_assert_eq!(Reader::new(bytes).read_int(width).unwrap(), value);
    }
}

// Property: variable-length unsigned integers round-trip and are minimal
proptest! {
    #[test]
    fn prop_var_uint_roundtrip(magnitude in prop::collection::vec(any::<u8>(), 0..40)) {
        let value = BigUint::from_bytes_be(&magnitude);
        let bytes = encoded(|w| w.write_var_uint(&value).unwrap());

        let mut reader = Reader::new(bytes.clone());
        prop_assert_eq!(reader.read_var_uint().unwrap(), value.clone());
        prop_assert_eq!(reader.remaining(), 0);

        let minimal = if value.is_zero() { 1 } else { value.to_bytes_be().len() };
        prop_assert_eq!(bytes[0] as usize, minimal);
    }
}

// Property: padding a variable-length unsigned integer with a zero byte is rejected
proptest! {
    #[test]
    fn prop_var_uint_padding_rejected(value in any::<u64>()) {
        let canonical = encoded(|w| w.write_var_uint_u64(value).unwrap());
        let mut padded = vec![canonical[0] + 1, 0x00];
        padded.extend_from_slice(&canonical[1..]);

        let result = Reader::new(padded).read_var_uint();
        let is_non_canonical = matches!(result, Err(OerError::NonCanonical { .. }));
        prop_assert!(is_non_canonical);
    }
}

// Property: variable-length signed integers round-trip; redundant sign bytes are rejected
proptest! {
    #[test]
    fn prop_var_int_roundtrip(value in any::<i64>()) {
        let bytes = encoded(|w| w.write_var_int(value).unwrap());
        prop_assert_eq!(Reader::new(bytes.clone()).read_var_int().unwrap(), value);

        let sign = if value < 0 { 0xff } else { 0x00 };
        let mut padded = vec![bytes[0] + 1, sign];
        padded.extend_from_slice(&bytes[1..]);
        prop_assert!(Reader::new(padded).read_var_int().is_err());
    }
}

// Property: length prefixes round-trip; long forms of short lengths are rejected
proptest! {
    #[test]
    fn prop_length_prefix_roundtrip(len in 0usize..1_000_000) {
        let bytes = encoded(|w| w.write_length_prefix(len).unwrap());
        prop_assert_eq!(bytes.len() == 1, len <= 127);
        prop_assert_eq!(Reader::new(bytes).read_length_prefix().unwrap(), len);
    }

    #[test]
    fn prop_long_form_short_length_rejected(len in 0u8..=127) {
        let result = Reader::new(vec![0x81, len]).read_length_prefix();
        let is_non_canonical = matches!(result, Err(OerError::NonCanonical { .. }));
        prop_assert!(is_non_canonical);
    }
}

// Property: reading past the end is always a range error
proptest! {
    #[test]
    fn prop_short_buffer_is_range_error(data in prop::collection::vec(any::<u8>(), 0..64), extra in 1usize..64) {
        let mut reader = Reader::new(data.clone());
        let result = reader.read(data.len() + extra);
        let is_range = matches!(result, Err(OerError::Range { .. }));
        prop_assert!(is_range);
        prop_assert_eq!(reader.cursor(), 0);
    }
}

// Property: holds conserve value whether executed or cancelled
proptest! {
    #[test]
    fn prop_hold_conservation(ops in prop::collection::vec((0u32..1000, 0u32..1500, any::<bool>()), 1..40)) {
        let stream = MoneyStream::detached(1);
        let mut sent = BigUint::zero();
        let mut executed = BigUint::zero();

        for (hold_id, (amount, max, execute)) in ops.into_iter().enumerate() {
            stream.send(amount).unwrap();
            sent += amount;
            let held = stream.hold_outgoing(hold_id as u64, Some(&BigUint::from(max)));
            prop_assert!(held <= BigUint::from(max));
            if execute {
                stream.execute_hold(hold_id as u64);
                executed += held;
            } else {
                stream.cancel_hold(hold_id as u64);
            }
            // Second resolution of the same hold changes nothing
            stream.cancel_hold(hold_id as u64);
        }

        prop_assert_eq!(stream.amount_outgoing() + executed, sent);
        prop_assert!(stream.amount_held().is_zero());
    }
}

// Property: the packet amount search delivers everything within a bounded number of packets
proptest! {
    #[test]
    fn prop_congestion_converges(ceiling in 100u64..10_000, desired in 1u64..100_000) {
        let mut controller = CongestionController::new();
        let mut remaining = BigUint::from(desired);
        let path_max = BigUint::from(ceiling);
        let log2 = u64::from(64 - desired.leading_zeros());
        let bound = 2 * log2 + 3 * desired / ceiling + 4;
        let mut packets = 0u64;

        while !remaining.is_zero() {
            let amount = controller.packet_amount(&remaining).expect("ceiling never collapses");
            packets += 1;
            prop_assert!(packets <= bound);
            if amount <= path_max {
                controller.on_fulfill(&amount);
                remaining -= &amount;
            } else {
                controller.on_capacity_unknown(&amount);
            }
        }
    }
}
