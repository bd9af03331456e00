// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use oracle_sync_config::AvailabilityValue;

/// Maximum availability value a node can be assigned for one epoch.
pub const EPOCH_MAX_VALUE: AvailabilityValue = 255;

/// Full availability means the node was seen online for at least ~80% of the
/// epoch. Only fully online oracles may participate in the next round.
pub const FULL_AVAILABILITY_THRESHOLD: AvailabilityValue = 204;

/// While full availability is measured against the observer's own records,
/// the observer may itself have been offline for part of the epoch and missed
/// seeing another oracle. The accepted offline time is therefore doubled when
/// judging announcements from others:
/// `EPOCH_MAX_VALUE - 2 * (EPOCH_MAX_VALUE - FULL_AVAILABILITY_THRESHOLD)`.
pub const POTENTIALLY_FULL_AVAILABILITY_THRESHOLD: AvailabilityValue =
    EPOCH_MAX_VALUE - 2 * (EPOCH_MAX_VALUE - FULL_AVAILABILITY_THRESHOLD);

/// How many oracles may be missing from a sending phase before early stop is
/// ruled out. Zero: every participating oracle must report for an early exit.
pub const ACCEPTED_REPORTS_THRESHOLD: usize = 0;

/// A median further than this from the local observation is logged as
/// suspicious. Diagnostics only, never aborts a round.
pub const ACCEPTED_MEDIAN_ERROR_MARGIN: AvailabilityValue =
    EPOCH_MAX_VALUE - POTENTIALLY_FULL_AVAILABILITY_THRESHOLD;

/// Phase timeout multipliers, applied to the configured send period.
pub(crate) const LOCAL_TABLE_SEND_MULTIPLIER: u32 = 2;
pub(crate) const SIGNATURES_EXCHANGE_MULTIPLIER: u32 = 2;
pub(crate) const REQUEST_AGREEMENT_TABLE_MULTIPLIER: u32 = 2;

/// Per-sender cap on buffered inbound messages. Overflow drops the oldest.
pub(crate) const PER_SENDER_INBOX_LIMIT: usize = 50;

/// Historical requests arriving with less than this many seconds left in the
/// current epoch are ignored; the server is about to extend that history.
pub(crate) const IGNORE_REQUESTS_SECONDS: u64 = 300;
