// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fastcrypto::hash::HashFunction;
use oracle_sync_config::DefaultHashFunction;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Content identifier of an offloaded payload: the hex-encoded digest of the
/// payload bytes.
pub type BlobId = String;

/// Computes the content identifier for the given bytes.
pub fn blob_id_for(bytes: &[u8]) -> BlobId {
    hex::encode(DefaultHashFunction::digest(bytes).to_vec())
}

/// Content-addressed store used to move large payloads out of protocol
/// messages. `put` must return an identifier that `get` resolves on every
/// node of the network.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, bytes: Bytes) -> SyncResult<BlobId>;

    async fn get(&self, id: &BlobId) -> SyncResult<Option<Bytes>>;

    /// Whether the store has finished warming up and can accept writes.
    fn is_ready(&self) -> bool {
        true
    }
}

/// In-process blob store, for tests and single-host deployments.
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<BlobId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Bytes) -> SyncResult<BlobId> {
        let id = blob_id_for(&bytes);
        self.blobs.lock().insert(id.clone(), bytes);
        Ok(id)
    }

    async fn get(&self, id: &BlobId) -> SyncResult<Option<Bytes>> {
        Ok(self.blobs.lock().get(id).cloned())
    }
}

/// A payload field that travels either inline or as a blob identifier.
/// Senders decide per message; recipients resolve transparently and fail the
/// message when resolution yields nothing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaybeBlob<T> {
    Inline(T),
    Blob(BlobId),
}

impl<T: Serialize + DeserializeOwned + Clone> MaybeBlob<T> {
    /// Offloads the value into the blob store when one is available and warmed
    /// up, otherwise embeds the value inline. Store failures fall back to
    /// inline delivery; the message always goes out.
    pub async fn offload(value: T, store: Option<&Arc<dyn BlobStore>>) -> Self {
        let Some(store) = store else {
            return MaybeBlob::Inline(value);
        };
        if !store.is_ready() {
            debug!("Blob store is not warmed up, embedding the payload inline");
            return MaybeBlob::Inline(value);
        }
        let bytes = match bcs::to_bytes(&value) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return MaybeBlob::Inline(value),
        };
        match store.put(bytes).await {
            Ok(id) => MaybeBlob::Blob(id),
            Err(error) => {
                debug!("Failed to offload a payload, embedding it inline: {error:?}");
                MaybeBlob::Inline(value)
            }
        }
    }

    /// Resolves a blob identifier back into the inline value. Inline values
    /// pass through untouched.
    pub async fn resolve(self, store: Option<&Arc<dyn BlobStore>>) -> SyncResult<T> {
        match self {
            MaybeBlob::Inline(value) => Ok(value),
            MaybeBlob::Blob(id) => {
                let store = store.ok_or(SyncError::BlobStoreUnavailable)?;
                let bytes = store
                    .get(&id)
                    .await?
                    .ok_or_else(|| SyncError::BlobUnavailable(id.clone()))?;
                bcs::from_bytes(&bytes).map_err(SyncError::MalformedMessage)
            }
        }
    }

    pub fn inline(&self) -> Option<&T> {
        match self {
            MaybeBlob::Inline(value) => Some(value),
            MaybeBlob::Blob(_) => None,
        }
    }

    pub fn into_inline(self) -> Option<T> {
        match self {
            MaybeBlob::Inline(value) => Some(value),
            MaybeBlob::Blob(_) => None,
        }
    }

    pub fn blob_id(&self) -> Option<&BlobId> {
        match self {
            MaybeBlob::Inline(_) => None,
            MaybeBlob::Blob(id) => Some(id),
        }
    }
}
