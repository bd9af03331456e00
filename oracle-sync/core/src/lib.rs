// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Availability consensus engine for a network of privileged oracle nodes.
//!
//! Once per epoch the oracles agree on an availability score for every known
//! node and maintain a signed, verifiable, multi-epoch availability history.
//! Each oracle runs one [`OracleSyncEngine`], stepped at a fixed cadence by
//! an [`OracleSyncNode`] task. A round starts when the epoch changes:
//! participants announce themselves, exchange their raw observations,
//! agree on per-node medians by frequency vote, collect signatures over the
//! canonical agreed table, and persist the settled epoch. Oracles that
//! cannot participate, or rounds that fail to reach quorum, fall back to
//! requesting the settled history from their peers and settling it by
//! hash-frequency vote.

mod blob;
mod constants;
mod context;
mod engine;
mod epoch_clock;
mod error;
mod history;
mod message;
mod metrics;
mod node;
mod roster;
mod round;
mod store;
mod tables;
mod transport;

#[cfg(test)]
mod test_fixture;
#[cfg(test)]
mod tests;

pub use blob::{blob_id_for, BlobId, BlobStore, MaybeBlob, MemoryBlobStore};
pub use constants::{
    ACCEPTED_MEDIAN_ERROR_MARGIN, ACCEPTED_REPORTS_THRESHOLD, EPOCH_MAX_VALUE,
    FULL_AVAILABILITY_THRESHOLD, POTENTIALLY_FULL_AVAILABILITY_THRESHOLD,
};
pub use context::Context;
pub use engine::{OracleSyncEngine, SyncState};
pub use epoch_clock::EpochClock;
pub use error::{SyncError, SyncResult};
pub use message::{
    canonical_agreement_bytes, AgreementSignature, AgreementSignatures, AvailabilityTable,
    EpochHistoryResponse, MedianTable, OracleMessage, Payload, SignedEnvelope, SignedMedianEntry,
};
pub use metrics::{initialize_metrics, Metrics, NodeMetrics};
pub use node::{OracleSyncHandle, OracleSyncNode};
pub use roster::{OracleRegistry, OracleRoster};
pub use store::{AvailabilityObserver, AvailabilityStore, EpochRecord};
pub use transport::{MessageTransport, TransportClient};
