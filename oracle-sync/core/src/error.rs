// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use fastcrypto::error::FastCryptoError;
use oracle_sync_config::{Epoch, NodeAddress};
use thiserror::Error;

use crate::blob::BlobId;
use crate::engine::SyncState;

/// Errors that can occur while syncing availability tables.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Error serializing: {0}")]
    SerializationFailure(bcs::Error),

    #[error("Error deserializing: {0}")]
    MalformedMessage(bcs::Error),

    #[error("Failed to verify the signature: {0}")]
    SignatureVerificationFailure(#[from] FastCryptoError),

    #[error("Sender {0} is not a known oracle")]
    UnknownSender(NodeAddress),

    #[error("Message carries stage {actual:?}, expected {expected:?}")]
    WrongStage {
        expected: SyncState,
        actual: SyncState,
    },

    #[error("Sender {sender} is not a participant of this round")]
    NotParticipating { sender: NodeAddress },

    #[error("Signer {signer} does not match sender {sender}")]
    SignerMismatch {
        sender: NodeAddress,
        signer: NodeAddress,
    },

    #[error("Blob {0} could not be resolved")]
    BlobUnavailable(BlobId),

    #[error("Blob offload is not configured")]
    BlobStoreUnavailable,

    #[error("Epoch {epoch} is not past last synced epoch {last_synced}")]
    EpochAlreadySynced { epoch: Epoch, last_synced: Epoch },

    #[error("No record stored for epoch {0}")]
    EpochNotFound(Epoch),

    #[error("Epoch {0} already has a blob id attached")]
    BlobIdAlreadySet(Epoch),

    #[error("Epoch keys of a historical response are malformed: {0}")]
    MalformedEpochKeys(String),

    #[error("Unknown squeezed key id {0} in a historical response")]
    UnknownSqueezedKey(String),

    #[error("Failed to persist the availability store: {0}")]
    StorePersistenceFailure(String),

    #[error("Oracle registry is unreachable: {0}")]
    RegistryUnavailable(String),

    #[error("Failed to broadcast a message: {0}")]
    BroadcastFailure(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::StorePersistenceFailure(error.to_string())
    }
}
