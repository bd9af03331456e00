// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The catch-up branch of the state machine: serving historical agreement
//! requests while waiting for the epoch to change, requesting the epochs
//! this oracle missed, and settling them by hash-frequency vote over the
//! received range-packs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use oracle_sync_config::{AvailabilityValue, Epoch, NodeAddress};
use tracing::{debug, info, warn};

use crate::blob::{BlobId, BlobStore, MaybeBlob};
use crate::constants::IGNORE_REQUESTS_SECONDS;
use crate::engine::{OracleSyncEngine, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::message::{
    AgreementSignature, AgreementSignatures, AvailabilityTable, EpochHistoryResponse, Payload,
};
use crate::tables;
use crate::transport::TransportClient;

/// One respondent's settled history for the requested epoch range.
#[derive(Default)]
pub(crate) struct EpochPack {
    pub tables: BTreeMap<Epoch, AvailabilityTable>,
    pub signatures: BTreeMap<Epoch, AgreementSignatures>,
    pub is_valid: BTreeMap<Epoch, bool>,
    pub blob_ids: BTreeMap<Epoch, Option<BlobId>>,
}

impl<C: TransportClient> OracleSyncEngine<C> {
    /// Answers historical agreement requests from oracles that are catching
    /// up. Runs while this oracle sits out the current epoch.
    pub(crate) async fn serve_epoch_requests(&mut self) -> SyncResult<()> {
        let mut requests = Vec::new();
        for message in self.transport.drain_inbox() {
            if !self.gate_stage(&message, SyncState::RequestEpochHistory) {
                continue;
            }
            let Payload::EpochHistoryRequest {
                start_epoch,
                end_epoch,
            } = message.payload
            else {
                self.record_drop("unexpected_payload");
                continue;
            };
            if start_epoch > end_epoch {
                self.record_drop("invalid_request");
                continue;
            }
            let left = self.context.clock.time_left_in_current_epoch();
            if left.as_secs() < IGNORE_REQUESTS_SECONDS {
                debug!(
                    "Ignoring a historical request {left:?} before the epoch change; \
                     this history is about to be extended"
                );
                continue;
            }
            info!(
                "Received a request from {} for epochs {start_epoch}..={end_epoch}",
                message.sender
            );
            requests.push((start_epoch, end_epoch));
        }
        for (start_epoch, end_epoch) in requests {
            self.send_epoch_history(start_epoch, end_epoch).await?;
            self.context
                .metrics
                .node_metrics
                .historical_requests_served
                .inc();
        }
        Ok(())
    }

    /// Broadcasts the settled history of the given epoch range. Missing and
    /// faulty epochs are served as empty invalid markers. Valid tables are
    /// published to the blob store when offload is enabled, and the resulting
    /// identifier is remembered on the record so later requests reuse it.
    async fn send_epoch_history(&mut self, start_epoch: Epoch, end_epoch: Epoch) -> SyncResult<()> {
        let squeeze = self.context.parameters.squeeze_epoch_dictionaries;
        let blob_store = self.history_blob_store();

        let mut id_to_address: BTreeMap<String, NodeAddress> = BTreeMap::new();
        let mut assigned: BTreeMap<NodeAddress, String> = BTreeMap::new();
        let mut key_for = |node: &NodeAddress| -> String {
            if !squeeze {
                return node.to_string();
            }
            if let Some(id) = assigned.get(node) {
                return id.clone();
            }
            let id = assigned.len().to_string();
            assigned.insert(*node, id.clone());
            id_to_address.insert(id.clone(), *node);
            id
        };

        let epoch_keys: Vec<Epoch> = (start_epoch..=end_epoch).collect();
        let records: Vec<_> = {
            let store = self.store.read();
            epoch_keys
                .iter()
                .map(|epoch| (*epoch, store.get_epoch(*epoch).cloned()))
                .collect()
        };

        let mut tables = BTreeMap::new();
        let mut signatures = BTreeMap::new();
        let mut is_valid = BTreeMap::new();
        let mut newly_uploaded: Vec<(Epoch, BlobId)> = Vec::new();

        for (epoch, record) in records {
            let key = epoch.to_string();
            match record {
                Some(record) if record.valid => {
                    let slot = match (&blob_store, &record.blob_id) {
                        (Some(_), Some(id)) => MaybeBlob::Blob(id.clone()),
                        (Some(store), None) => {
                            // Blob contents always carry full address keys so
                            // they stay valid across requests.
                            let full: BTreeMap<String, AvailabilityValue> = record
                                .table
                                .iter()
                                .map(|(node, value)| (node.to_string(), *value))
                                .collect();
                            match upload_table(store, &full).await {
                                Ok(id) => {
                                    newly_uploaded.push((epoch, id.clone()));
                                    MaybeBlob::Blob(id)
                                }
                                Err(error) => {
                                    debug!("Failed to publish epoch {epoch}: {error:?}");
                                    self.context
                                        .metrics
                                        .node_metrics
                                        .blob_offload_fallbacks
                                        .inc();
                                    MaybeBlob::Inline(
                                        record
                                            .table
                                            .iter()
                                            .map(|(node, value)| (key_for(node), *value))
                                            .collect(),
                                    )
                                }
                            }
                        }
                        (None, _) => MaybeBlob::Inline(
                            record
                                .table
                                .iter()
                                .map(|(node, value)| (key_for(node), *value))
                                .collect(),
                        ),
                    };
                    tables.insert(key.clone(), slot);
                    signatures.insert(
                        key.clone(),
                        record
                            .signatures
                            .iter()
                            .map(|(signer, signature)| (key_for(signer), signature.clone()))
                            .collect::<BTreeMap<String, AgreementSignature>>(),
                    );
                    is_valid.insert(key, true);
                }
                _ => {
                    // Missing or faulty: an empty marker tells the requester
                    // that no consensus exists for this epoch.
                    tables.insert(key.clone(), MaybeBlob::Inline(BTreeMap::new()));
                    signatures.insert(key.clone(), BTreeMap::new());
                    is_valid.insert(key, false);
                }
            }
        }

        if !newly_uploaded.is_empty() {
            let mut store = self.store.write();
            for (epoch, id) in newly_uploaded {
                if let Err(error) = store.attach_blob_id(epoch, id) {
                    debug!("Could not attach the blob id to epoch {epoch}: {error:?}");
                }
            }
            store.persist()?;
        }

        if self.context.parameters.debug_sync_full {
            debug!("Serving history tables: {tables:?}, validity: {is_valid:?}");
        }
        info!("Broadcasting availability history for epochs {start_epoch}..={end_epoch}");
        self.transport
            .broadcast(
                SyncState::WaitForEpochChange,
                Payload::EpochHistoryResponse(EpochHistoryResponse {
                    epoch_keys,
                    tables,
                    signatures,
                    is_valid,
                    id_to_address,
                }),
            )
            .await?;
        Ok(())
    }

    /// Periodically requests the epochs between the last synced one and the
    /// finished one, and validates the responses as they arrive. A response
    /// must cover the whole requested range, and every signature of every
    /// valid epoch must verify against that epoch's received table; one
    /// failure drops the response whole.
    pub(crate) async fn request_and_receive_history(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let last_synced = self.store.read().last_synced_epoch();
        let (want_lo, want_hi) = (last_synced + 1, target_epoch);

        // Responses can only answer a request that was already sent.
        if self.round.request_timer.started() {
            for message in self.transport.drain_inbox() {
                if !self.gate_stage(&message, SyncState::WaitForEpochChange) {
                    continue;
                }
                let Payload::EpochHistoryResponse(response) = message.payload else {
                    self.record_drop("unexpected_payload");
                    continue;
                };
                match self
                    .process_history_response(response, want_lo, want_hi)
                    .await
                {
                    Ok(pack) => {
                        info!(
                            "[{}/{}] Received valid history for epochs {want_lo}..={want_hi} \
                             from {}",
                            self.round.received_packs.len() + 1,
                            self.total_participating(),
                            message.sender
                        );
                        self.round.received_packs.insert(message.sender, pack);
                    }
                    Err(error) => {
                        debug!(
                            "Invalid historical response from {}: {error:?}",
                            message.sender
                        );
                        self.record_drop("invalid_history_response");
                    }
                }
            }
        }

        if last_synced >= target_epoch {
            debug!("Last synced epoch is the previous epoch, nothing to request");
            return Ok(());
        }

        if self
            .round
            .request_timer
            .send_due(self.context.parameters.send_interval)
        {
            self.round.request_timer.start();
            info!("Requesting agreed history for epochs {want_lo}..={want_hi}");
            self.transport
                .broadcast(
                    SyncState::RequestEpochHistory,
                    Payload::EpochHistoryRequest {
                        start_epoch: want_lo,
                        end_epoch: want_hi,
                    },
                )
                .await?;
            self.round.request_timer.mark_sent();
        }
        Ok(())
    }

    async fn process_history_response(
        &self,
        response: EpochHistoryResponse,
        want_lo: Epoch,
        want_hi: Epoch,
    ) -> SyncResult<EpochPack> {
        let EpochHistoryResponse {
            epoch_keys,
            mut tables,
            mut signatures,
            is_valid,
            id_to_address,
        } = response;

        let (Some(min), Some(max)) = (
            epoch_keys.iter().min().copied(),
            epoch_keys.iter().max().copied(),
        ) else {
            return Err(SyncError::MalformedEpochKeys("no epochs".to_string()));
        };
        if epoch_keys.len() as u64 != max - min + 1 {
            return Err(SyncError::MalformedEpochKeys(format!(
                "epochs {min}..{max} are not continuous"
            )));
        }
        if min > want_lo || max < want_hi {
            return Err(SyncError::MalformedEpochKeys(format!(
                "epochs {min}..={max} do not cover the requested {want_lo}..={want_hi}"
            )));
        }

        let expected: BTreeSet<String> = epoch_keys.iter().map(|epoch| epoch.to_string()).collect();
        for keys in [
            tables.keys().cloned().collect::<BTreeSet<_>>(),
            signatures.keys().cloned().collect(),
            is_valid.keys().cloned().collect(),
        ] {
            if keys != expected {
                return Err(SyncError::MalformedEpochKeys(
                    "epoch key sets do not match".to_string(),
                ));
            }
        }

        // Only the requested range is kept; anything extra the respondent
        // sent along is discarded.
        let mut pack = EpochPack::default();
        for epoch in want_lo..=want_hi {
            let key = epoch.to_string();
            let valid = is_valid
                .get(&key)
                .copied()
                .ok_or_else(|| SyncError::MalformedEpochKeys(key.clone()))?;

            let slot = tables
                .remove(&key)
                .ok_or_else(|| SyncError::MalformedEpochKeys(key.clone()))?;
            let (raw_table, blob_id) = match slot {
                MaybeBlob::Inline(table) => (table, None),
                MaybeBlob::Blob(id) => {
                    let store = self
                        .blob_store
                        .as_ref()
                        .ok_or(SyncError::BlobStoreUnavailable)?;
                    let bytes = store
                        .get(&id)
                        .await?
                        .ok_or_else(|| SyncError::BlobUnavailable(id.clone()))?;
                    let table: BTreeMap<String, AvailabilityValue> =
                        bcs::from_bytes(&bytes).map_err(SyncError::MalformedMessage)?;
                    (table, Some(id))
                }
            };

            let table: AvailabilityTable = raw_table
                .into_iter()
                .map(|(key, value)| Ok((resolve_address_key(&key, &id_to_address)?, value)))
                .collect::<SyncResult<_>>()?;

            let epoch_signatures: AgreementSignatures = signatures
                .remove(&key)
                .unwrap_or_default()
                .into_iter()
                .map(|(key, signature)| Ok((resolve_address_key(&key, &id_to_address)?, signature)))
                .collect::<SyncResult<_>>()?;

            if valid {
                if epoch_signatures.is_empty() {
                    return Err(SyncError::MalformedEpochKeys(format!(
                        "valid epoch {epoch} carries no signatures"
                    )));
                }
                for (signer, signature) in &epoch_signatures {
                    if signature.signer != *signer {
                        return Err(SyncError::SignerMismatch {
                            sender: *signer,
                            signer: signature.signer,
                        });
                    }
                    signature.verify(&table, epoch)?;
                }
            }

            pack.tables.insert(epoch, table);
            pack.signatures.insert(epoch, epoch_signatures);
            pack.is_valid.insert(epoch, valid);
            pack.blob_ids.insert(epoch, blob_id);
        }
        Ok(pack)
    }

    /// Settles the requested range from the received packs. Every pack is
    /// hashed whole; the most frequent hash wins if it is backed by more
    /// than half of the respondents, and the smallest backing address is
    /// imported. Anything less marks the whole range as faulty.
    pub(crate) fn compute_requested_history(&mut self) -> SyncResult<()> {
        let Some(target_epoch) = self.round.target_epoch else {
            return Ok(());
        };
        let last_synced = self.store.read().last_synced_epoch();
        let (want_lo, want_hi) = (last_synced + 1, target_epoch);
        if want_lo > want_hi {
            return Ok(());
        }

        if self.round.received_packs.is_empty() {
            warn!("No historical responses received");
            return self.mark_requested_epochs_faulty(want_lo, want_hi);
        }

        let digests: BTreeMap<NodeAddress, String> = self
            .round
            .received_packs
            .iter()
            .map(|(oracle, pack)| (*oracle, tables::range_pack_digest(&pack.tables)))
            .collect();
        let mut frequencies: BTreeMap<&str, usize> = BTreeMap::new();
        for digest in digests.values() {
            *frequencies.entry(digest).or_default() += 1;
        }
        let top_frequency = *frequencies.values().max().unwrap();

        if top_frequency * 2 <= digests.len() {
            warn!(
                "Respondents do not agree on the history: best hash frequency {top_frequency} \
                 out of {} responses",
                digests.len()
            );
            return self.mark_requested_epochs_faulty(want_lo, want_hi);
        }

        // Every oracle in the winning cohort holds the same bytes; taking
        // the smallest address keeps the choice deterministic.
        let chosen = digests
            .iter()
            .find(|(_, digest)| frequencies[digest.as_str()] == top_frequency)
            .map(|(oracle, _)| *oracle)
            .unwrap();
        let mut pack = self.round.received_packs.remove(&chosen).unwrap();

        let mut store = self.store.write();
        for (epoch, table) in pack.tables {
            if epoch <= store.last_synced_epoch() {
                debug!("Epoch {epoch} is already settled, skipping");
                continue;
            }
            let valid = pack.is_valid.get(&epoch).copied().unwrap_or(false);
            if valid {
                let signatures = pack.signatures.remove(&epoch).unwrap_or_default();
                let blob_id = pack.blob_ids.remove(&epoch).flatten();
                store.write_epoch(epoch, table, signatures, true, blob_id)?;
            } else {
                store.mark_faulty(epoch)?;
                self.context.metrics.node_metrics.epochs_marked_faulty.inc();
            }
        }
        store.persist()?;
        self.context
            .metrics
            .node_metrics
            .last_synced_epoch
            .set(store.last_synced_epoch() as i64);

        info!("Imported the settled history for epochs {want_lo}..={want_hi} from {chosen}");
        Ok(())
    }

    fn mark_requested_epochs_faulty(&mut self, want_lo: Epoch, want_hi: Epoch) -> SyncResult<()> {
        warn!("Marking epochs {want_lo}..={want_hi} as faulty, no consensus could be imported");
        let mut store = self.store.write();
        for epoch in want_lo..=want_hi {
            if epoch <= store.last_synced_epoch() {
                continue;
            }
            store.mark_faulty(epoch)?;
            self.context.metrics.node_metrics.epochs_marked_faulty.inc();
        }
        store.persist()?;
        self.context
            .metrics
            .node_metrics
            .last_synced_epoch
            .set(store.last_synced_epoch() as i64);
        Ok(())
    }

    /// Blob store to use for historical responses, if enabled.
    fn history_blob_store(&self) -> Option<Arc<dyn BlobStore>> {
        if self.context.parameters.use_blob_offload {
            self.blob_store.clone()
        } else {
            None
        }
    }
}

/// Maps a wire key back to a node address: through the squeeze map when one
/// was sent, directly otherwise.
fn resolve_address_key(
    key: &str,
    id_to_address: &BTreeMap<String, NodeAddress>,
) -> SyncResult<NodeAddress> {
    if let Some(address) = id_to_address.get(key) {
        return Ok(*address);
    }
    key.parse()
        .map_err(|_| SyncError::UnknownSqueezedKey(key.to_string()))
}

async fn upload_table(
    store: &Arc<dyn BlobStore>,
    table: &BTreeMap<String, AvailabilityValue>,
) -> SyncResult<BlobId> {
    if !store.is_ready() {
        return Err(SyncError::BlobStoreUnavailable);
    }
    let bytes = bcs::to_bytes(table).map_err(SyncError::SerializationFailure)?;
    store.put(bytes.into()).await
}
