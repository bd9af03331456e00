// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the oracle sync protocol.
//!
//! Every message travels as a [`SignedEnvelope`]: the serialized message
//! together with the sender's signature over exactly those bytes. Payload
//! fields that may be large are declared [`MaybeBlob`] and can carry a
//! content identifier instead of the value itself.

use std::collections::BTreeMap;

use bytes::Bytes;
use oracle_sync_config::{
    AvailabilityValue, Epoch, NodeAddress, OracleKeyPair, OracleSignature,
};
use serde::{Deserialize, Serialize};

use crate::blob::{BlobId, MaybeBlob};
use crate::engine::SyncState;
use crate::error::{SyncError, SyncResult};

/// One oracle's availability observations for one epoch.
pub type AvailabilityTable = BTreeMap<NodeAddress, AvailabilityValue>;

/// One oracle's signed medians for one epoch.
pub type MedianTable = BTreeMap<NodeAddress, SignedMedianEntry>;

/// Signatures over one epoch's agreed table, keyed by signer.
pub type AgreementSignatures = BTreeMap<NodeAddress, AgreementSignature>;

/// One oracle's proposed median availability for one node in one epoch.
/// The signature covers the value together with the epoch and the node the
/// value is for; both are reconstructed by the verifier from context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMedianEntry {
    pub value: AvailabilityValue,
    pub signer: NodeAddress,
    pub signature: OracleSignature,
}

#[derive(Serialize)]
struct MedianEntryDigest {
    value: AvailabilityValue,
    epoch: Epoch,
    node: NodeAddress,
}

impl SignedMedianEntry {
    pub fn new(
        value: AvailabilityValue,
        epoch: Epoch,
        node: NodeAddress,
        keypair: &OracleKeyPair,
    ) -> Self {
        let digest = MedianEntryDigest {
            value,
            epoch,
            node,
        };
        let message = bcs::to_bytes(&digest).expect("Serialization should not fail");
        Self {
            value,
            signer: keypair.address(),
            signature: keypair.sign(&message),
        }
    }

    pub fn verify(&self, epoch: Epoch, node: NodeAddress) -> SyncResult<()> {
        let digest = MedianEntryDigest {
            value: self.value,
            epoch,
            node,
        };
        let message = bcs::to_bytes(&digest).expect("Serialization should not fail");
        let key = self.signer.verifying_key()?;
        key.verify(&message, &self.signature)?;
        Ok(())
    }
}

/// A signer's signature over the canonical form of an epoch's agreed table.
///
/// The table itself is never part of the message carrying this signature:
/// every honest oracle that collects signatures has computed the same table,
/// so verifying the signature against the local copy both authenticates the
/// signer and asserts table equality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementSignature {
    pub signer: NodeAddress,
    pub signature: OracleSignature,
}

#[derive(Serialize)]
struct AgreementDigest {
    table: AvailabilityTable,
    epoch: Epoch,
}

/// The canonical signed form of an agreed table: zero-valued entries are
/// dropped, remaining entries are serialized in key order, and the epoch is
/// appended. Verifiers must rebuild this exact form.
pub fn canonical_agreement_bytes(table: &AvailabilityTable, epoch: Epoch) -> Vec<u8> {
    let non_zero: AvailabilityTable = table
        .iter()
        .filter(|(_, value)| **value != 0)
        .map(|(node, value)| (*node, *value))
        .collect();
    let digest = AgreementDigest {
        table: non_zero,
        epoch,
    };
    bcs::to_bytes(&digest).expect("Serialization should not fail")
}

impl AgreementSignature {
    pub fn new(table: &AvailabilityTable, epoch: Epoch, keypair: &OracleKeyPair) -> Self {
        let message = canonical_agreement_bytes(table, epoch);
        Self {
            signer: keypair.address(),
            signature: keypair.sign(&message),
        }
    }

    pub fn verify(&self, table: &AvailabilityTable, epoch: Epoch) -> SyncResult<()> {
        let message = canonical_agreement_bytes(table, epoch);
        let key = self.signer.verifying_key()?;
        key.verify(&message, &self.signature)?;
        Ok(())
    }
}

/// Availability history for a requested epoch range, as served by an oracle
/// waiting out the current epoch.
///
/// Epoch keys are rendered as strings on the wire; `epoch_keys` carries the
/// authoritative integer form. When `id_to_address` is non-empty, node
/// address keys inside `tables` and `signatures` have been replaced by small
/// integer ids ("squeezed") and must be mapped back before use. Table slots
/// may carry blob identifiers instead of inline tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochHistoryResponse {
    pub epoch_keys: Vec<Epoch>,
    pub tables: BTreeMap<String, MaybeBlob<BTreeMap<String, AvailabilityValue>>>,
    pub signatures: BTreeMap<String, BTreeMap<String, AgreementSignature>>,
    pub is_valid: BTreeMap<String, bool>,
    pub id_to_address: BTreeMap<String, NodeAddress>,
}

/// Everything an oracle can say to another oracle, tagged by the protocol
/// phase the sender believes itself to be in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// The sender's view of who participates in the starting round.
    Announce { participants: Vec<NodeAddress> },
    /// The sender's raw availability observations for the finished epoch.
    LocalTable {
        table: MaybeBlob<AvailabilityTable>,
    },
    /// The sender's signed per-node medians for the finished epoch.
    MedianTable { table: MaybeBlob<MedianTable> },
    /// The sender's signature over the agreed table it computed.
    AgreementSignature { signature: AgreementSignature },
    /// Every agreement signature the sender has collected so far.
    AgreementSignatures { signatures: AgreementSignatures },
    /// A request for the agreed history of a continuous epoch range.
    EpochHistoryRequest { start_epoch: Epoch, end_epoch: Epoch },
    /// An answer to an [`Payload::EpochHistoryRequest`].
    EpochHistoryResponse(EpochHistoryResponse),
}

impl Payload {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Payload::Announce { .. } => "announce",
            Payload::LocalTable { .. } => "local_table",
            Payload::MedianTable { .. } => "median_table",
            Payload::AgreementSignature { .. } => "agreement_signature",
            Payload::AgreementSignatures { .. } => "agreement_signatures",
            Payload::EpochHistoryRequest { .. } => "epoch_history_request",
            Payload::EpochHistoryResponse { .. } => "epoch_history_response",
        }
    }
}

/// A protocol message before signing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleMessage {
    pub sender: NodeAddress,
    pub stage: SyncState,
    pub payload: Payload,
}

/// A protocol message as it travels on the wire. The signature covers the
/// serialized message bytes exactly as sent, blob identifiers included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    message: OracleMessage,
    signature: OracleSignature,
}

impl SignedEnvelope {
    pub fn new(message: OracleMessage, keypair: &OracleKeyPair) -> Self {
        let bytes = bcs::to_bytes(&message).expect("Serialization should not fail");
        let signature = keypair.sign(&bytes);
        Self { message, signature }
    }

    pub fn serialized(&self) -> SyncResult<Bytes> {
        let bytes = bcs::to_bytes(self).map_err(SyncError::SerializationFailure)?;
        Ok(Bytes::from(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        bcs::from_bytes(bytes).map_err(SyncError::MalformedMessage)
    }

    pub fn verify(&self) -> SyncResult<()> {
        let bytes = bcs::to_bytes(&self.message).map_err(SyncError::SerializationFailure)?;
        let key = self.message.sender.verifying_key()?;
        key.verify(&bytes, &self.signature)?;
        Ok(())
    }

    pub fn sender(&self) -> NodeAddress {
        self.message.sender
    }

    pub fn into_message(self) -> OracleMessage {
        self.message
    }

    #[cfg(test)]
    pub(crate) fn message_mut(&mut self) -> &mut OracleMessage {
        &mut self.message
    }
}
