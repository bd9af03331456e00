// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The consensus round proper: from announcing participation over exchanging
//! local and median tables to collecting agreement signatures and persisting
//! the settled epoch.

use std::collections::BTreeSet;
use std::sync::Arc;

use oracle_sync_config::NodeAddress;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, MaybeBlob};
use crate::constants::ACCEPTED_MEDIAN_ERROR_MARGIN;
use crate::engine::{OracleSyncEngine, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::message::{
    AgreementSignature, AvailabilityTable, MedianTable, Payload, SignedMedianEntry,
};
use crate::tables;
use crate::transport::TransportClient;

impl<C: TransportClient> OracleSyncEngine<C> {
    /// Announces this oracle's participation in the starting round and
    /// observes the other oracles' announcements. The broadcast carries the
    /// whole set accepted so far, so announcements spread transitively.
    pub(crate) async fn announce_and_observe(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            debug!("No completed epoch yet, nothing to announce");
            return Ok(());
        };
        if !self.can_participate() {
            let reason = if self.roster.is_oracle(&self.context.own_address) {
                "not fully online in the previous epoch"
            } else {
                "not a registry oracle"
            };
            info!("Not announcing participation: {reason}");
            return Ok(());
        }

        if self.round.announce_timer.start() {
            info!("Starting the consensus round for epoch {target_epoch}");
            self.round
                .announced_participants
                .insert(self.context.own_address);
            self.update_potential_threshold();
        }

        let interval = self.context.parameters.send_interval / 3;
        if self.round.announce_timer.send_due(interval) {
            let participants: Vec<NodeAddress> =
                self.round.announced_participants.iter().copied().collect();
            debug!("Announcing {} participants", participants.len());
            self.transport
                .broadcast(
                    SyncState::AnnounceParticipants,
                    Payload::Announce { participants },
                )
                .await?;
            self.round.announce_timer.mark_sent();
        }

        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::AnnounceParticipants) {
                continue;
            }
            let Payload::Announce { participants } = message.payload else {
                self.record_drop("unexpected_payload");
                continue;
            };
            // Announcements naming a non-oracle are discarded whole.
            if participants.iter().any(|addr| !self.roster.is_oracle(addr)) {
                debug!(
                    "Announcement from {} names addresses outside the oracle registry",
                    message.sender
                );
                self.record_drop("invalid_announcement");
                continue;
            }
            for address in participants {
                if self.was_potentially_full_online(&address) {
                    self.round.announced_participants.insert(address);
                } else {
                    debug!(
                        "Announced node {address} was not potentially fully online, not keeping it"
                    );
                }
            }
            debug!(
                "Announcements from {}: {} participants in total",
                message.sender,
                self.round.announced_participants.len()
            );
        }
        Ok(())
    }

    /// Builds the local availability table for the finished epoch and fixes
    /// the participant set from the announcements gathered so far.
    pub(crate) fn compute_local_table(&mut self) -> SyncResult<()> {
        let observer = self.observer.clone();
        self.round.local_table = observer
            .known_nodes()
            .into_iter()
            .map(|node| {
                let value = observer.previous_epoch_value(&node);
                (node, value)
            })
            .collect();

        for oracle in self.roster.current_oracles() {
            let participating = self.round.announced_participants.contains(&oracle);
            self.round.is_participating.insert(oracle, participating);
        }

        let participating = self
            .round
            .is_participating
            .values()
            .filter(|yes| **yes)
            .count();
        info!(
            "Start of the sync round for epoch {:?}: {} nodes observed, \
             {participating}/{} oracles participating (potential threshold {})",
            self.round.target_epoch,
            self.round.local_table.len(),
            self.round.is_participating.len(),
            self.round.potential_threshold,
        );
        Ok(())
    }

    /// Periodically broadcasts the local table and stores the tables the
    /// other participants broadcast.
    pub(crate) async fn exchange_local_tables(&mut self) -> SyncResult<()> {
        if self.round.local_table_timer.start() {
            // Seed with the own table so a lone oracle still makes progress.
            self.round
                .received_local_tables
                .insert(self.context.own_address, self.round.local_table.clone());
        }

        if self
            .round
            .local_table_timer
            .send_due(self.context.parameters.send_interval)
        {
            let blob_store = self.consensus_blob_store();
            let table =
                MaybeBlob::offload(self.round.local_table.clone(), blob_store.as_ref()).await;
            self.transport
                .broadcast(SyncState::SendLocalTable, Payload::LocalTable { table })
                .await?;
            self.round.local_table_timer.mark_sent();
        }

        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::SendLocalTable) {
                continue;
            }
            let Payload::LocalTable { table } = message.payload else {
                self.record_drop("unexpected_payload");
                continue;
            };
            if !self.gate_participant(&message.sender) {
                continue;
            }
            let Some(table) = table.into_inline() else {
                self.record_drop("unresolved_blob");
                continue;
            };
            debug!(
                "[{}/{}] Received a local table from {}",
                self.round.received_local_tables.len() + 1,
                self.total_participating(),
                message.sender
            );
            if self.context.parameters.debug_sync_full {
                debug!("Local table from {}: {table:?}", message.sender);
            }
            self.round.received_local_tables.insert(message.sender, table);
        }
        Ok(())
    }

    /// Reduces the received local tables to one signed median per node. With
    /// half or fewer of the participants reporting, no median is computed
    /// and the round is abandoned.
    pub(crate) fn compute_median_table(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let table_count = self.round.received_local_tables.len();
        let half = self.half_of_participating();
        if table_count <= half {
            warn!(
                "Could not compute medians: gathered only {table_count} local tables, \
                 need more than {half}"
            );
            self.round.median_table = None;
            return Ok(());
        }

        let mut all_nodes: BTreeSet<NodeAddress> = BTreeSet::new();
        for table in self.round.received_local_tables.values() {
            all_nodes.extend(table.keys().copied());
        }

        let mut median_table = MedianTable::new();
        for node in all_nodes {
            // A node missing from a table was simply never seen: value 0.
            let mut values: Vec<_> = self
                .round
                .received_local_tables
                .values()
                .map(|table| table.get(&node).copied().unwrap_or(0))
                .collect();
            let median_value = tables::median(&mut values);

            let local_value = self.round.local_table.get(&node).copied().unwrap_or(0);
            let median_error = (median_value as i64 - local_value as i64).unsigned_abs();
            if median_error > ACCEPTED_MEDIAN_ERROR_MARGIN as u64 {
                warn!(
                    "Median for {node} diverges from the local observation: \
                     local {local_value}, median {median_value}"
                );
            }

            median_table.insert(
                node,
                SignedMedianEntry::new(median_value, target_epoch, node, &self.keypair),
            );
        }

        info!(
            "Computed medians for {} nodes from {table_count} local tables",
            median_table.len()
        );
        self.round.median_table = (!median_table.is_empty()).then_some(median_table);

        let responders: BTreeSet<_> = self.round.received_local_tables.keys().copied().collect();
        self.update_participants(&responders);
        Ok(())
    }

    /// Periodically broadcasts the signed median table and stores the tables
    /// the other participants broadcast, verifying every entry.
    pub(crate) async fn exchange_median_tables(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };

        if self.round.median_table_timer.start() {
            if let Some(median_table) = self.round.median_table.clone() {
                self.round
                    .received_median_tables
                    .insert(self.context.own_address, median_table);
            }
        }

        if self
            .round
            .median_table_timer
            .send_due(self.context.parameters.send_interval)
        {
            if let Some(median_table) = self.round.median_table.clone() {
                let blob_store = self.consensus_blob_store();
                let table = MaybeBlob::offload(median_table, blob_store.as_ref()).await;
                self.transport
                    .broadcast(SyncState::SendMedianTable, Payload::MedianTable { table })
                    .await?;
                self.round.median_table_timer.mark_sent();
            }
        }

        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::SendMedianTable) {
                continue;
            }
            let Payload::MedianTable { table } = message.payload else {
                self.record_drop("unexpected_payload");
                continue;
            };
            if !self.gate_participant(&message.sender) {
                continue;
            }
            let Some(table) = table.into_inline() else {
                self.record_drop("unresolved_blob");
                continue;
            };
            if let Err(error) = verify_median_table(&message.sender, &table, target_epoch) {
                debug!("Invalid median table from {}: {error:?}", message.sender);
                self.record_drop("invalid_median_table");
                continue;
            }
            debug!(
                "[{}/{}] Received a median table from {}",
                self.round.received_median_tables.len() + 1,
                self.total_participating(),
                message.sender
            );
            self.round
                .received_median_tables
                .insert(message.sender, table);
        }
        Ok(())
    }

    /// Reduces the received median tables to the agreed table: per node, the
    /// most frequent median wins, and the win must be backed by more than
    /// half of the participants. A single contested node abandons the whole
    /// round.
    pub(crate) fn compute_agreed_table(&mut self) -> SyncResult<()> {
        let mut all_nodes: BTreeSet<NodeAddress> = BTreeSet::new();
        for table in self.round.received_median_tables.values() {
            all_nodes.extend(table.keys().copied());
        }

        let half = self.half_of_participating();
        let mut agreed = AvailabilityTable::new();
        for node in all_nodes {
            // Senders are iterated in address order, so the first-occurrence
            // tie-break of the winner is identical on every honest oracle.
            let values: Vec<_> = self
                .round
                .received_median_tables
                .values()
                .filter_map(|table| table.get(&node).map(|entry| entry.value))
                .collect();
            let (winner, frequency) = tables::frequency_winner(&values);
            if frequency <= half {
                warn!(
                    "No agreement on {node}: best frequency {frequency} out of {} \
                     median tables, need more than {half}",
                    values.len()
                );
                self.round.agreed_table = None;
                return Ok(());
            }
            agreed.insert(node, winner);
        }

        if agreed.is_empty() {
            warn!("No median tables to agree on");
            self.round.agreed_table = None;
            return Ok(());
        }

        info!(
            "Agreed on {} nodes from {} median tables",
            agreed.len(),
            self.round.received_median_tables.len()
        );
        self.round.agreed_table = Some(agreed);

        let responders: BTreeSet<_> = self.round.received_median_tables.keys().copied().collect();
        self.update_participants(&responders);
        Ok(())
    }

    /// Broadcasts this oracle's signature over the agreed table and collects
    /// the other participants' signatures. The table itself is never sent:
    /// verifying a signature against the locally computed table both
    /// authenticates the signer and proves the tables are equal.
    pub(crate) async fn collect_signatures(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let Some(agreed) = self.round.agreed_table.clone() else {
            return Ok(());
        };

        if self.round.signature_timer.start() {
            let own = AgreementSignature::new(&agreed, target_epoch, &self.keypair);
            self.round
                .collected_signatures
                .insert(self.context.own_address, own);
        }

        if self
            .round
            .signature_timer
            .send_due(self.context.parameters.send_interval)
        {
            if let Some(signature) = self
                .round
                .collected_signatures
                .get(&self.context.own_address)
                .cloned()
            {
                self.transport
                    .broadcast(
                        SyncState::SendAgreementSignature,
                        Payload::AgreementSignature { signature },
                    )
                    .await?;
                self.round.signature_timer.mark_sent();
            }
        }

        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::SendAgreementSignature) {
                continue;
            }
            let Payload::AgreementSignature { signature } = message.payload else {
                self.record_drop("unexpected_payload");
                continue;
            };
            if !self.gate_participant(&message.sender) {
                continue;
            }
            if signature.signer != message.sender {
                warn!(
                    "Agreement signature from {} claims signer {}",
                    message.sender, signature.signer
                );
                self.record_drop("signer_mismatch");
                continue;
            }
            if signature.verify(&agreed, target_epoch).is_err() {
                debug!("Agreement signature from {} does not match", message.sender);
                self.record_drop("invalid_signature");
                continue;
            }
            debug!(
                "[{}/{}] Received an agreement signature from {}",
                self.round.collected_signatures.len() + 1,
                self.total_participating(),
                message.sender
            );
            self.round
                .collected_signatures
                .insert(message.sender, signature);
        }
        Ok(())
    }

    /// Broadcasts the whole collected signature map and merges the maps the
    /// other participants broadcast, re-verifying everything. This hardens
    /// the signature set against partial visibility: a signature any one
    /// participant saw ends up with all of them.
    pub(crate) async fn exchange_signatures(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let Some(agreed) = self.round.agreed_table.clone() else {
            return Ok(());
        };

        self.round.exchange_timer.start();
        if self
            .round
            .exchange_timer
            .send_due(self.context.parameters.send_interval)
        {
            self.transport
                .broadcast(
                    SyncState::ExchangeAgreementSignatures,
                    Payload::AgreementSignatures {
                        signatures: self.round.collected_signatures.clone(),
                    },
                )
                .await?;
            self.round.exchange_timer.mark_sent();
        }

        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::ExchangeAgreementSignatures) {
                continue;
            }
            let Payload::AgreementSignatures { signatures } = message.payload else {
                self.record_drop("unexpected_payload");
                continue;
            };
            if !self.gate_participant(&message.sender) {
                continue;
            }

            // One bad entry discards the whole set.
            let all_valid = signatures.iter().all(|(signer, signature)| {
                self.round
                    .is_participating
                    .get(signer)
                    .copied()
                    .unwrap_or(false)
                    && signature.signer == *signer
                    && signature.verify(&agreed, target_epoch).is_ok()
            });
            if !all_valid || signatures.is_empty() {
                debug!("Invalid signature set from {}", message.sender);
                self.record_drop("invalid_signature_set");
                continue;
            }

            for (signer, signature) in signatures {
                self.round
                    .collected_signatures
                    .entry(signer)
                    .or_insert(signature);
            }
            debug!(
                "Merged signatures from {}: {}/{} collected",
                message.sender,
                self.round.collected_signatures.len(),
                self.total_participating()
            );
        }
        Ok(())
    }

    /// Writes the settled epoch to the availability store. The record is
    /// valid only when at least one collected signature belongs to a current
    /// registry oracle.
    pub(crate) async fn persist_epoch(&mut self) -> SyncResult<()> {
        let Some(epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let Some(agreed) = self.round.agreed_table.clone() else {
            return Ok(());
        };
        let signatures = self.round.collected_signatures.clone();
        let valid = signatures.keys().any(|signer| self.roster.is_oracle(signer));

        {
            let mut store = self.store.write();
            if epoch <= store.last_synced_epoch() {
                info!("Epoch {epoch} is already settled, skipping the update");
                return Ok(());
            }
            if valid {
                store.write_epoch(epoch, agreed, signatures.clone(), true, None)?;
            } else {
                store.mark_faulty(epoch)?;
                self.context.metrics.node_metrics.epochs_marked_faulty.inc();
            }
            store.persist()?;
            self.context
                .metrics
                .node_metrics
                .last_synced_epoch
                .set(store.last_synced_epoch() as i64);
        }

        self.context.metrics.node_metrics.rounds_completed.inc();
        info!(
            "Settled epoch {epoch} ({}) with {} agreement signatures from {} announced participants",
            if valid { "valid" } else { "no oracle signature" },
            signatures.len(),
            self.round.announced_participants.len(),
        );
        Ok(())
    }

    /// Blob store to use for consensus-phase payloads, if enabled.
    pub(crate) fn consensus_blob_store(&self) -> Option<Arc<dyn BlobStore>> {
        if self.context.parameters.use_blob_offload_during_consensus {
            self.blob_store.clone()
        } else {
            None
        }
    }
}

/// Every entry of a received median table must be signed by the table's
/// sender, over the value, the epoch under agreement and the node the value
/// is for.
fn verify_median_table(
    sender: &NodeAddress,
    table: &MedianTable,
    target_epoch: u64,
) -> SyncResult<()> {
    if table.is_empty() {
        return Err(SyncError::MalformedEpochKeys(
            "empty median table".to_string(),
        ));
    }
    for (node, entry) in table {
        if entry.signer != *sender {
            return Err(SyncError::SignerMismatch {
                sender: *sender,
                signer: entry.signer,
            });
        }
        entry.verify(target_epoch, *node)?;
    }
    Ok(())
}
