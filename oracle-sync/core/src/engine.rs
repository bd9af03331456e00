// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The availability consensus state machine.
//!
//! Each oracle runs one engine as a long-lived cooperative task. A step
//! advances the state machine once: the handler of the current state sends
//! what is due, drains at most one inbound message per sender, and the
//! transition table decides whether to move on. One pass from the
//! announcement phase to persistence settles the availability of every known
//! node for the epoch that just ended; the request/compute branch imports
//! settled epochs this oracle missed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use oracle_sync_config::{Epoch, NodeAddress, OracleKeyPair};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::constants::{
    EPOCH_MAX_VALUE, FULL_AVAILABILITY_THRESHOLD, LOCAL_TABLE_SEND_MULTIPLIER,
    POTENTIALLY_FULL_AVAILABILITY_THRESHOLD, REQUEST_AGREEMENT_TABLE_MULTIPLIER,
    SIGNATURES_EXCHANGE_MULTIPLIER,
};
use crate::context::Context;
use crate::error::SyncResult;
use crate::history::EpochPack;
use crate::message::{
    AgreementSignatures, AvailabilityTable, MedianTable, OracleMessage,
};
use crate::roster::OracleRoster;
use crate::store::{AvailabilityObserver, AvailabilityStore};
use crate::transport::{MessageTransport, TransportClient};

/// The states of the sync protocol. Outbound messages are tagged with the
/// sender's state, and receivers drop anything not matching the phase they
/// are themselves in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Serve historical requests while waiting for the epoch to change.
    WaitForEpochChange,
    /// Announce own participation and observe the other oracles'.
    AnnounceParticipants,
    /// Build the local availability table for the finished epoch.
    ComputeLocalTable,
    /// Exchange local tables between participants.
    SendLocalTable,
    /// Reduce the received local tables to signed per-node medians.
    ComputeMedianTable,
    /// Exchange signed median tables between participants.
    SendMedianTable,
    /// Reduce the received median tables to the agreed table.
    ComputeAgreedMedianTable,
    /// Broadcast own agreement signature and collect the others'.
    SendAgreementSignature,
    /// Exchange the collected signature sets to harden them.
    ExchangeAgreementSignatures,
    /// Persist the agreed table and its signatures.
    UpdateEpochHistory,
    /// Request settled epochs this oracle is missing.
    RequestEpochHistory,
    /// Reduce the received historical packs and write them through.
    ComputeRequestedEpochHistory,
}

impl SyncState {
    /// Stable numeric index for metrics and logs.
    pub fn index(&self) -> i64 {
        match self {
            SyncState::WaitForEpochChange => 0,
            SyncState::ComputeLocalTable => 1,
            SyncState::SendLocalTable => 2,
            SyncState::ComputeMedianTable => 3,
            SyncState::SendMedianTable => 4,
            SyncState::ComputeAgreedMedianTable => 5,
            SyncState::SendAgreementSignature => 6,
            SyncState::UpdateEpochHistory => 7,
            SyncState::RequestEpochHistory => 8,
            SyncState::ComputeRequestedEpochHistory => 9,
            SyncState::ExchangeAgreementSignatures => 10,
            SyncState::AnnounceParticipants => 11,
        }
    }
}

/// Tracks the sending cadence of one phase: when the phase first sent
/// (timeouts are measured from there) and when it last sent (re-broadcasts
/// are rate-limited).
pub(crate) struct PhaseTimer {
    first_send: Option<Instant>,
    last_send: Option<Instant>,
}

impl PhaseTimer {
    pub(crate) fn new() -> Self {
        Self {
            first_send: None,
            last_send: None,
        }
    }

    /// Marks the beginning of the phase. Returns true on the first call.
    pub(crate) fn start(&mut self) -> bool {
        if self.first_send.is_some() {
            return false;
        }
        self.first_send = Some(Instant::now());
        true
    }

    pub(crate) fn started(&self) -> bool {
        self.first_send.is_some()
    }

    pub(crate) fn send_due(&self, interval: Duration) -> bool {
        match self.last_send {
            None => true,
            Some(last) => last.elapsed() >= interval,
        }
    }

    pub(crate) fn mark_sent(&mut self) {
        self.last_send = Some(Instant::now());
    }

    pub(crate) fn expired(&self, timeout: Duration) -> bool {
        self.first_send
            .map(|first| first.elapsed() > timeout)
            .unwrap_or(false)
    }
}

/// Everything a single consensus round accumulates. Discarded and rebuilt
/// whenever the engine returns to waiting or enters a new round.
pub(crate) struct RoundState {
    /// The epoch that was current when this round state was created.
    pub round_epoch: Epoch,
    /// The completed epoch this round agrees on. None while in epoch 0.
    pub target_epoch: Option<Epoch>,
    /// Threshold above which another oracle's announcement is accepted,
    /// relaxed by this oracle's own blind spots.
    pub potential_threshold: i64,
    pub announced_participants: BTreeSet<NodeAddress>,
    pub is_participating: BTreeMap<NodeAddress, bool>,
    pub local_table: AvailabilityTable,
    pub received_local_tables: BTreeMap<NodeAddress, AvailabilityTable>,
    pub median_table: Option<MedianTable>,
    pub received_median_tables: BTreeMap<NodeAddress, MedianTable>,
    pub agreed_table: Option<AvailabilityTable>,
    pub collected_signatures: AgreementSignatures,
    pub received_packs: BTreeMap<NodeAddress, EpochPack>,
    pub announce_timer: PhaseTimer,
    pub local_table_timer: PhaseTimer,
    pub median_table_timer: PhaseTimer,
    pub signature_timer: PhaseTimer,
    pub exchange_timer: PhaseTimer,
    pub request_timer: PhaseTimer,
}

impl RoundState {
    pub(crate) fn new(round_epoch: Epoch) -> Self {
        Self {
            round_epoch,
            target_epoch: round_epoch.checked_sub(1),
            potential_threshold: POTENTIALLY_FULL_AVAILABILITY_THRESHOLD as i64,
            announced_participants: BTreeSet::new(),
            is_participating: BTreeMap::new(),
            local_table: BTreeMap::new(),
            received_local_tables: BTreeMap::new(),
            median_table: None,
            received_median_tables: BTreeMap::new(),
            agreed_table: None,
            collected_signatures: BTreeMap::new(),
            received_packs: BTreeMap::new(),
            announce_timer: PhaseTimer::new(),
            local_table_timer: PhaseTimer::new(),
            median_table_timer: PhaseTimer::new(),
            signature_timer: PhaseTimer::new(),
            exchange_timer: PhaseTimer::new(),
            request_timer: PhaseTimer::new(),
        }
    }
}

/// One oracle's availability consensus engine.
pub struct OracleSyncEngine<C: TransportClient> {
    pub(crate) context: Arc<Context>,
    pub(crate) keypair: OracleKeyPair,
    pub(crate) transport: Arc<MessageTransport<C>>,
    pub(crate) roster: Arc<OracleRoster>,
    pub(crate) store: Arc<RwLock<AvailabilityStore>>,
    pub(crate) observer: Arc<dyn AvailabilityObserver>,
    pub(crate) blob_store: Option<Arc<dyn BlobStore>>,
    pub(crate) state: SyncState,
    pub(crate) round: RoundState,
    exception_occurred: bool,
    last_self_assessment: Option<Instant>,
}

impl<C: TransportClient> OracleSyncEngine<C> {
    pub fn new(
        context: Arc<Context>,
        keypair: OracleKeyPair,
        transport: Arc<MessageTransport<C>>,
        roster: Arc<OracleRoster>,
        store: Arc<RwLock<AvailabilityStore>>,
        observer: Arc<dyn AvailabilityObserver>,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        let round = RoundState::new(context.clock.current_epoch());
        Self {
            context,
            keypair,
            transport,
            roster,
            store,
            observer,
            blob_store,
            // A fresh engine first catches up on the epochs it missed while
            // offline, then falls into the wait state.
            state: SyncState::RequestEpochHistory,
            round,
            exception_occurred: false,
            last_self_assessment: None,
        }
    }

    /// Performs one atomic step: run the current state's handler, then
    /// evaluate transitions. A handler error is logged, sets the sticky
    /// exception flag and leaves the machine in place; the supervising
    /// caller may clear the flag and keep stepping.
    pub async fn step(&mut self) {
        self.roster.maybe_refresh();
        if let Err(err) = self.run_state().await {
            error!("Error in state {:?}: {err:?}", self.state);
            self.exception_occurred = true;
            return;
        }
        self.evaluate_transitions();
        self.context
            .metrics
            .node_metrics
            .current_state
            .set(self.state.index());
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn exception_occurred(&self) -> bool {
        self.exception_occurred
    }

    pub fn clear_exception(&mut self) {
        self.exception_occurred = false;
    }

    pub fn store(&self) -> Arc<RwLock<AvailabilityStore>> {
        self.store.clone()
    }

    pub fn transport(&self) -> Arc<MessageTransport<C>> {
        self.transport.clone()
    }

    async fn run_state(&mut self) -> SyncResult<()> {
        match self.state {
            SyncState::WaitForEpochChange => {
                self.serve_epoch_requests().await?;
                self.maybe_self_assessment();
                Ok(())
            }
            SyncState::AnnounceParticipants => self.announce_and_observe().await,
            SyncState::ComputeLocalTable => self.compute_local_table(),
            SyncState::SendLocalTable => self.exchange_local_tables().await,
            SyncState::ComputeMedianTable => self.compute_median_table(),
            SyncState::SendMedianTable => self.exchange_median_tables().await,
            SyncState::ComputeAgreedMedianTable => self.compute_agreed_table(),
            SyncState::SendAgreementSignature => self.collect_signatures().await,
            SyncState::ExchangeAgreementSignatures => self.exchange_signatures().await,
            SyncState::UpdateEpochHistory => self.persist_epoch().await,
            SyncState::RequestEpochHistory => self.request_and_receive_history().await,
            SyncState::ComputeRequestedEpochHistory => self.compute_requested_history(),
        }
    }

    fn evaluate_transitions(&mut self) {
        let send_period = self.context.parameters.send_period;
        let next = match self.state {
            SyncState::WaitForEpochChange => {
                if self.context.clock.current_epoch() != self.round.round_epoch {
                    self.reset_round();
                    Some(SyncState::AnnounceParticipants)
                } else {
                    None
                }
            }
            SyncState::AnnounceParticipants => {
                if !self.can_participate() {
                    info!("Cannot participate in this round, requesting the epoch from peers");
                    Some(SyncState::RequestEpochHistory)
                } else if self.round.announce_timer.expired(send_period / 2) {
                    Some(SyncState::ComputeLocalTable)
                } else {
                    None
                }
            }
            SyncState::ComputeLocalTable => {
                if self.can_participate() {
                    Some(SyncState::SendLocalTable)
                } else {
                    Some(SyncState::RequestEpochHistory)
                }
            }
            SyncState::SendLocalTable => {
                let done = self
                    .round
                    .local_table_timer
                    .expired(send_period * LOCAL_TABLE_SEND_MULTIPLIER)
                    || self.early_stop(self.round.received_local_tables.len(), false, "local tables");
                done.then_some(SyncState::ComputeMedianTable)
            }
            SyncState::ComputeMedianTable => {
                if self.round.median_table.is_some() {
                    Some(SyncState::SendMedianTable)
                } else {
                    self.abandon_round();
                    Some(SyncState::RequestEpochHistory)
                }
            }
            SyncState::SendMedianTable => {
                let done = self.round.median_table_timer.expired(send_period)
                    || self.early_stop(
                        self.round.received_median_tables.len(),
                        false,
                        "median tables",
                    );
                done.then_some(SyncState::ComputeAgreedMedianTable)
            }
            SyncState::ComputeAgreedMedianTable => {
                if self.round.agreed_table.is_some() {
                    Some(SyncState::SendAgreementSignature)
                } else {
                    self.abandon_round();
                    Some(SyncState::RequestEpochHistory)
                }
            }
            SyncState::SendAgreementSignature => {
                let done = self.round.signature_timer.expired(send_period)
                    || self.early_stop(
                        self.round.collected_signatures.len(),
                        false,
                        "agreement signatures",
                    );
                done.then_some(SyncState::ExchangeAgreementSignatures)
            }
            SyncState::ExchangeAgreementSignatures => {
                let done = self
                    .round
                    .exchange_timer
                    .expired(send_period * SIGNATURES_EXCHANGE_MULTIPLIER)
                    || self.early_stop(
                        self.round.collected_signatures.len(),
                        true,
                        "exchanged signature sets",
                    );
                done.then_some(SyncState::UpdateEpochHistory)
            }
            SyncState::UpdateEpochHistory => {
                self.reset_round();
                Some(SyncState::WaitForEpochChange)
            }
            SyncState::RequestEpochHistory => {
                if self.nothing_to_request() {
                    self.reset_round();
                    Some(SyncState::WaitForEpochChange)
                } else if self.round.request_timer.started()
                    && (self
                        .round
                        .request_timer
                        .expired(send_period * REQUEST_AGREEMENT_TABLE_MULTIPLIER)
                        // The requester itself can never answer, so one
                        // missing report is always tolerated here.
                        || self.early_stop_with_tolerance(
                            self.round.received_packs.len(),
                            1,
                            "historical packs",
                        ))
                {
                    Some(SyncState::ComputeRequestedEpochHistory)
                } else {
                    None
                }
            }
            SyncState::ComputeRequestedEpochHistory => {
                self.reset_round();
                Some(SyncState::WaitForEpochChange)
            }
        };

        if let Some(next) = next {
            if self.context.parameters.debug_sync {
                info!("Transition {:?} -> {next:?}", self.state);
            } else {
                debug!("Transition {:?} -> {next:?}", self.state);
            }
            self.state = next;
        }
    }

    /// Discards all round-local state and re-anchors on the current epoch
    /// and the store's last synced epoch.
    pub(crate) fn reset_round(&mut self) {
        let round_epoch = self.context.clock.current_epoch();
        let last_synced = self.store.read().last_synced_epoch();
        debug!("Resetting round state: current epoch {round_epoch}, last synced {last_synced}");
        self.round = RoundState::new(round_epoch);
    }

    fn abandon_round(&mut self) {
        warn!(
            "Abandoning the round for epoch {:?}, requesting it from peers instead",
            self.round.target_epoch
        );
        self.context.metrics.node_metrics.rounds_abandoned.inc();
    }

    /// This oracle may take part in the round iff the registry lists it and
    /// it observed itself fully online in the finished epoch.
    pub(crate) fn can_participate(&self) -> bool {
        if self.round.target_epoch.is_none() {
            return false;
        }
        self.roster.is_oracle(&self.context.own_address)
            && self.observer.previous_epoch_value(&self.context.own_address)
                >= FULL_AVAILABILITY_THRESHOLD
    }

    /// Whether the node could have been fully online in the finished epoch,
    /// judged with this oracle's own observation gaps taken into account.
    pub(crate) fn was_potentially_full_online(&self, node: &NodeAddress) -> bool {
        (self.observer.previous_epoch_value(node) as i64) >= self.round.potential_threshold
    }

    /// Relaxes the announcement acceptance threshold by the time this oracle
    /// cannot account for: another oracle may have been online while we were
    /// not looking.
    pub(crate) fn update_potential_threshold(&mut self) {
        let own = self.observer.previous_epoch_value(&self.context.own_address);
        let unknown = (EPOCH_MAX_VALUE - own) as i64;
        let previous = self.round.potential_threshold;
        self.round.potential_threshold = FULL_AVAILABILITY_THRESHOLD as i64 - unknown;
        info!(
            "Updated potentially-full-online threshold from {previous} to {}",
            self.round.potential_threshold
        );
    }

    /// Number of oracles this node expects reports from. Before any
    /// participation is known, the whole roster is assumed.
    pub(crate) fn total_participating(&self) -> usize {
        let participating = self
            .round
            .is_participating
            .values()
            .filter(|yes| **yes)
            .count();
        if participating == 0 {
            self.roster.len()
        } else {
            participating
        }
    }

    /// Quorum denominator of the agreement checks: half the oracles this
    /// node considers participating.
    pub(crate) fn half_of_participating(&self) -> usize {
        self.round
            .is_participating
            .values()
            .filter(|yes| **yes)
            .count()
            / 2
    }

    fn early_stop(&self, received: usize, ignore_tolerance: bool, what: &str) -> bool {
        let tolerance = if ignore_tolerance {
            0
        } else {
            crate::constants::ACCEPTED_REPORTS_THRESHOLD
        };
        self.early_stop_with_tolerance(received, tolerance, what)
    }

    fn early_stop_with_tolerance(&self, received: usize, tolerance: usize, what: &str) -> bool {
        let total = self.total_participating();
        let threshold = total.saturating_sub(tolerance).max(1);
        if received >= threshold {
            debug!("Received {received}/{total} {what}, stopping the phase early");
            true
        } else {
            false
        }
    }

    /// Narrows the participant set to the oracles that actually reported in
    /// the phase that just ended. An oracle that went quiet mid-round is not
    /// expected to report in later phases either.
    pub(crate) fn update_participants(&mut self, responders: &BTreeSet<NodeAddress>) {
        let mut disappeared = Vec::new();
        for (oracle, participating) in self.round.is_participating.iter_mut() {
            if *participating && !responders.contains(oracle) {
                *participating = false;
                disappeared.push(*oracle);
            }
        }
        if !disappeared.is_empty() {
            warn!(
                "{} oracles disappeared mid-round: {disappeared:?}",
                disappeared.len()
            );
        }
    }

    /// Stage gate: every message must carry the stage its receiver is
    /// serving. Anything else is noise from a peer in a different phase.
    pub(crate) fn gate_stage(&self, message: &OracleMessage, expected: SyncState) -> bool {
        if message.stage == expected {
            return true;
        }
        debug!(
            "Dropping message from {} with stage {:?}, expected {expected:?}",
            message.sender, message.stage
        );
        self.record_drop("wrong_stage");
        false
    }

    /// Participant gate: once the participant set is fixed, messages from
    /// oracles outside it are dropped even when otherwise well-formed.
    pub(crate) fn gate_participant(&self, sender: &NodeAddress) -> bool {
        if self
            .round
            .is_participating
            .get(sender)
            .copied()
            .unwrap_or(false)
        {
            return true;
        }
        debug!("Dropping message from non-participant {sender}");
        self.record_drop("not_participating");
        false
    }

    pub(crate) fn record_drop(&self, reason: &'static str) {
        self.context
            .metrics
            .node_metrics
            .messages_dropped
            .with_label_values(&[reason])
            .inc();
    }

    fn nothing_to_request(&self) -> bool {
        match self.round.target_epoch {
            None => true,
            Some(target) => self.store.read().last_synced_epoch() >= target,
        }
    }

    /// Periodically projects this node's own end-of-epoch availability, so
    /// operators can tell ahead of time whether it will participate in the
    /// next round.
    fn maybe_self_assessment(&mut self) {
        let interval = self.context.parameters.self_assessment_interval;
        if let Some(last) = self.last_self_assessment {
            if last.elapsed() < interval {
                return;
            }
        }
        self.last_self_assessment = Some(Instant::now());

        let (online_secs, elapsed_secs) = self.observer.current_epoch_uptime();
        let epoch_secs = self.context.clock.epoch_length().as_secs().max(1);
        let seen = online_secs as f64 / epoch_secs as f64;
        let elapsed = elapsed_secs as f64 / epoch_secs as f64;
        let missed = (elapsed - seen).max(0.0);
        let predicted = 1.0 - missed;
        let required = FULL_AVAILABILITY_THRESHOLD as f64 / EPOCH_MAX_VALUE as f64;
        info!(
            "Self-assessment: {:.1}% seen online, {:.1}% of epoch passed, projected {:.1}% \
             (needs {:.1}%): {} participate in the next round",
            seen * 100.0,
            elapsed * 100.0,
            predicted * 100.0,
            required * 100.0,
            if predicted >= required { "will" } else { "will not" },
        );
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: SyncState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn force_round_epoch(&mut self, epoch: Epoch) {
        self.round.round_epoch = epoch;
        self.round.target_epoch = epoch.checked_sub(1);
    }
}
