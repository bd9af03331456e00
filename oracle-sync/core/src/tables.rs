// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pure table arithmetic of the consensus rounds: element-wise medians over
//! local tables, frequency-based winners over median tables, and digests of
//! historical range-packs.

use std::collections::BTreeMap;

use fastcrypto::hash::HashFunction;
use itertools::Itertools as _;
use oracle_sync_config::{AvailabilityValue, DefaultHashFunction, Epoch};

use crate::message::AvailabilityTable;

/// Median of a non-empty set of availability values. An even count averages
/// the two middle values, rounding halves to the nearest even integer.
pub(crate) fn median(values: &mut Vec<AvailabilityValue>) -> AvailabilityValue {
    assert!(!values.is_empty(), "Median of an empty value set");
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        return values[mid];
    }
    let sum = values[mid - 1] as u16 + values[mid] as u16;
    let half = sum / 2;
    if sum % 2 == 0 {
        half as AvailabilityValue
    } else if half % 2 == 0 {
        // x.5 rounds to the nearest even integer.
        half as AvailabilityValue
    } else {
        (half + 1) as AvailabilityValue
    }
}

/// The most frequent value in the given sequence together with its
/// frequency. Ties are broken by first occurrence, so callers must feed
/// values in a deterministic order.
pub(crate) fn frequency_winner(values: &[AvailabilityValue]) -> (AvailabilityValue, usize) {
    assert!(!values.is_empty(), "Winner of an empty value set");
    let counts = values.iter().counts();
    let max_count = *counts.values().max().unwrap();
    let winner = *values
        .iter()
        .find(|value| counts[*value] == max_count)
        .unwrap();
    (winner, max_count)
}

/// Digest of a respondent's entire epoch range-pack. Historical catch-up
/// votes on whole packs, not on individual epochs, so respondents must agree
/// byte-for-byte on the complete range to be counted together.
pub(crate) fn range_pack_digest(tables: &BTreeMap<Epoch, AvailabilityTable>) -> String {
    let bytes = bcs::to_bytes(tables).expect("Serialization should not fail");
    hex::encode(DefaultHashFunction::digest(&bytes).to_vec())
}
