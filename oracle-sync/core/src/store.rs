// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use oracle_sync_config::{AvailabilityValue, Epoch, NodeAddress};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::BlobId;
use crate::error::{SyncError, SyncResult};
use crate::message::{AgreementSignatures, AvailabilityTable};

/// The settled availability outcome of one epoch.
///
/// Records are immutable once written, except for the late attachment of the
/// content identifier under which the table was published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochRecord {
    pub table: AvailabilityTable,
    pub signatures: AgreementSignatures,
    pub valid: bool,
    pub blob_id: Option<BlobId>,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreState {
    last_synced_epoch: Epoch,
    records: BTreeMap<Epoch, EpochRecord>,
}

/// Persistent history of agreed availability tables and their signatures.
///
/// Writes only move forward: an epoch at or below the last synced epoch is
/// rejected, and a successful write advances the last synced epoch. A record
/// with `valid = false` marks an epoch for which consensus was never reached.
pub struct AvailabilityStore {
    state: StoreState,
    path: Option<PathBuf>,
}

impl AvailabilityStore {
    /// An empty store. When a path is given, `persist` flushes there.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            state: StoreState::default(),
            path,
        }
    }

    /// Restores a store from its persisted file. A missing file yields an
    /// empty store, so first boots need no special casing.
    pub fn load(path: PathBuf) -> SyncResult<Self> {
        let state = match fs::read(&path) {
            Ok(bytes) => bcs::from_bytes(&bytes).map_err(SyncError::MalformedMessage)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(error) => return Err(error.into()),
        };
        Ok(Self {
            state,
            path: Some(path),
        })
    }

    pub fn last_synced_epoch(&self) -> Epoch {
        self.state.last_synced_epoch
    }

    pub fn get_epoch(&self, epoch: Epoch) -> Option<&EpochRecord> {
        self.state.records.get(&epoch)
    }

    /// Writes the settled record of an epoch and advances the last synced
    /// epoch to it.
    pub fn write_epoch(
        &mut self,
        epoch: Epoch,
        table: AvailabilityTable,
        signatures: AgreementSignatures,
        valid: bool,
        blob_id: Option<BlobId>,
    ) -> SyncResult<()> {
        if epoch <= self.state.last_synced_epoch {
            return Err(SyncError::EpochAlreadySynced {
                epoch,
                last_synced: self.state.last_synced_epoch,
            });
        }
        self.state.records.insert(
            epoch,
            EpochRecord {
                table,
                signatures,
                valid,
                blob_id,
            },
        );
        self.state.last_synced_epoch = epoch;
        debug!("Recorded epoch {epoch} (valid: {valid})");
        Ok(())
    }

    /// Records an epoch for which consensus could not be reached.
    pub fn mark_faulty(&mut self, epoch: Epoch) -> SyncResult<()> {
        self.write_epoch(epoch, BTreeMap::new(), BTreeMap::new(), false, None)
    }

    /// Attaches the content identifier under which the epoch's table was
    /// published. Permitted only once, and only for an existing record.
    pub fn attach_blob_id(&mut self, epoch: Epoch, blob_id: BlobId) -> SyncResult<()> {
        let record = self
            .state
            .records
            .get_mut(&epoch)
            .ok_or(SyncError::EpochNotFound(epoch))?;
        if record.blob_id.is_some() {
            return Err(SyncError::BlobIdAlreadySet(epoch));
        }
        record.blob_id = Some(blob_id);
        Ok(())
    }

    /// Flushes the store to durable storage, atomically replacing the
    /// previous file. A store without a path is memory-only and persists
    /// nothing.
    pub fn persist(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = bcs::to_bytes(&self.state).map_err(SyncError::SerializationFailure)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Source of the raw availability observations consumed by the engine. The
/// observations are produced by a collaborating network-monitoring
/// subsystem; the engine only reads them.
pub trait AvailabilityObserver: Send + Sync + 'static {
    /// Every node this oracle has observed, itself included.
    fn known_nodes(&self) -> Vec<NodeAddress>;

    /// The local observation of a node's availability in the just-finished
    /// epoch. Unknown nodes read as 0.
    fn previous_epoch_value(&self, node: &NodeAddress) -> AvailabilityValue;

    /// Seconds this node has been observed online in the current epoch so
    /// far, together with the seconds elapsed since the epoch began.
    fn current_epoch_uptime(&self) -> (u64, u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_sync_config::local_roster_and_keys;

    use crate::message::AgreementSignature;

    fn sample_epoch(
        epoch: Epoch,
    ) -> (AvailabilityTable, AgreementSignatures, Vec<NodeAddress>) {
        let (_roster, keys) = local_roster_and_keys(3);
        let addresses: Vec<_> = keys.iter().map(|key| key.address()).collect();
        let table: AvailabilityTable = addresses.iter().map(|a| (*a, 210)).collect();
        let signatures: AgreementSignatures = keys
            .iter()
            .map(|key| (key.address(), AgreementSignature::new(&table, epoch, key)))
            .collect();
        (table, signatures, addresses)
    }

    #[test]
    fn writes_advance_last_synced_monotonically() {
        let mut store = AvailabilityStore::new(None);
        assert_eq!(store.last_synced_epoch(), 0);

        let (table, signatures, _) = sample_epoch(1);
        store
            .write_epoch(1, table.clone(), signatures.clone(), true, None)
            .unwrap();
        assert_eq!(store.last_synced_epoch(), 1);

        // Rewrites of settled epochs are rejected.
        assert!(store
            .write_epoch(1, table.clone(), signatures.clone(), true, None)
            .is_err());
        assert!(store.mark_faulty(0).is_err());

        store.write_epoch(2, table, signatures, true, None).unwrap();
        assert_eq!(store.last_synced_epoch(), 2);
    }

    #[test]
    fn faulty_epochs_are_empty_and_invalid() {
        let mut store = AvailabilityStore::new(None);
        store.mark_faulty(1).unwrap();

        let record = store.get_epoch(1).unwrap();
        assert!(!record.valid);
        assert!(record.table.is_empty());
        assert!(record.signatures.is_empty());
        assert_eq!(store.last_synced_epoch(), 1);
    }

    #[test]
    fn blob_id_attaches_once() {
        let mut store = AvailabilityStore::new(None);
        let (table, signatures, _) = sample_epoch(1);
        store.write_epoch(1, table, signatures, true, None).unwrap();

        store.attach_blob_id(1, "c1d2".to_string()).unwrap();
        assert!(store.attach_blob_id(1, "e3f4".to_string()).is_err());
        assert!(store.attach_blob_id(9, "a0b1".to_string()).is_err());
        assert_eq!(store.get_epoch(1).unwrap().blob_id.as_deref(), Some("c1d2"));
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("availability.db");

        let (table, signatures, addresses) = sample_epoch(1);
        {
            let mut store = AvailabilityStore::load(path.clone()).unwrap();
            store
                .write_epoch(1, table.clone(), signatures.clone(), true, None)
                .unwrap();
            store.mark_faulty(2).unwrap();
            store.persist().unwrap();
        }

        let store = AvailabilityStore::load(path).unwrap();
        assert_eq!(store.last_synced_epoch(), 2);
        let record = store.get_epoch(1).unwrap();
        assert!(record.valid);
        assert_eq!(record.table, table);
        assert_eq!(record.signatures.len(), addresses.len());
        for signature in record.signatures.values() {
            assert!(signature.verify(&record.table, 1).is_ok());
        }
        assert!(!store.get_epoch(2).unwrap().valid);
    }
}
