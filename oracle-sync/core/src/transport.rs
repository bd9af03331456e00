// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use oracle_sync_config::{NodeAddress, OracleKeyPair};
use parking_lot::Mutex;
use tracing::debug;

use crate::blob::{BlobStore, MaybeBlob};
use crate::constants::PER_SENDER_INBOX_LIMIT;
use crate::context::Context;
use crate::engine::SyncState;
use crate::error::{SyncError, SyncResult};
use crate::message::{OracleMessage, Payload, SignedEnvelope};
use crate::roster::OracleRoster;

/// The network an oracle talks over. `broadcast` delivers the bytes to every
/// other oracle; delivery may duplicate, reorder or drop.
#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    async fn broadcast(&self, bytes: Bytes) -> SyncResult<()>;
}

/// Signs, serializes and broadcasts outbound protocol messages, and
/// verifies, resolves and queues inbound ones.
///
/// Inbound messages are buffered per sender in bounded deques; overflow
/// drops the oldest message of that sender, so a spamming oracle can neither
/// starve the others nor grow memory. Draining returns at most one message
/// per sender, oldest first, preserving fairness across senders.
pub struct MessageTransport<C: TransportClient> {
    context: Arc<Context>,
    keypair: OracleKeyPair,
    roster: Arc<OracleRoster>,
    client: Arc<C>,
    blob_store: Option<Arc<dyn BlobStore>>,
    inbox: Mutex<BTreeMap<NodeAddress, VecDeque<OracleMessage>>>,
}

impl<C: TransportClient> MessageTransport<C> {
    pub fn new(
        context: Arc<Context>,
        keypair: OracleKeyPair,
        roster: Arc<OracleRoster>,
        client: Arc<C>,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            context,
            keypair,
            roster,
            client,
            blob_store,
            inbox: Mutex::new(BTreeMap::new()),
        }
    }

    /// Signs and broadcasts a message tagged with the given stage.
    pub async fn broadcast(&self, stage: SyncState, payload: Payload) -> SyncResult<()> {
        let label = payload.label();
        let message = OracleMessage {
            sender: self.context.own_address,
            stage,
            payload,
        };
        let envelope = SignedEnvelope::new(message, &self.keypair);
        self.client.broadcast(envelope.serialized()?).await?;
        self.context
            .metrics
            .node_metrics
            .messages_broadcast
            .with_label_values(&[label])
            .inc();
        Ok(())
    }

    /// Ingests one inbound wire message. Malformed envelopes, unknown
    /// senders, invalid signatures and unresolvable blob payloads are
    /// dropped here, before anything reaches the state machine.
    pub async fn receive(&self, bytes: Bytes) {
        match self.try_receive(bytes).await {
            Ok(message) => {
                self.context
                    .metrics
                    .node_metrics
                    .messages_accepted
                    .with_label_values(&[message.payload.label()])
                    .inc();
                self.enqueue(message);
            }
            Err(error) => {
                debug!("Dropping inbound message: {error:?}");
                self.context
                    .metrics
                    .node_metrics
                    .messages_dropped
                    .with_label_values(&[drop_reason(&error)])
                    .inc();
            }
        }
    }

    async fn try_receive(&self, bytes: Bytes) -> SyncResult<OracleMessage> {
        let envelope = SignedEnvelope::from_bytes(&bytes)?;
        let sender = envelope.sender();
        if !self.roster.is_oracle(&sender) {
            return Err(SyncError::UnknownSender(sender));
        }
        envelope.verify()?;

        let mut message = envelope.into_message();
        self.resolve_payload(&mut message.payload).await?;
        Ok(message)
    }

    /// Resolves the maybe-id fields of consensus-phase payloads. Historical
    /// responses keep their per-epoch blob slots: the catch-up branch
    /// resolves those itself so it can remember the identifiers it writes
    /// through to the store.
    async fn resolve_payload(&self, payload: &mut Payload) -> SyncResult<()> {
        match payload {
            Payload::LocalTable { table } => {
                let resolved = std::mem::replace(table, MaybeBlob::Blob(String::new()))
                    .resolve(self.blob_store.as_ref())
                    .await?;
                *table = MaybeBlob::Inline(resolved);
            }
            Payload::MedianTable { table } => {
                let resolved = std::mem::replace(table, MaybeBlob::Blob(String::new()))
                    .resolve(self.blob_store.as_ref())
                    .await?;
                *table = MaybeBlob::Inline(resolved);
            }
            _ => {}
        }
        Ok(())
    }

    fn enqueue(&self, message: OracleMessage) {
        let mut inbox = self.inbox.lock();
        let queue = inbox.entry(message.sender).or_default();
        queue.push_back(message);
        if queue.len() > PER_SENDER_INBOX_LIMIT {
            queue.pop_front();
            self.context.metrics.node_metrics.inbox_overflow.inc();
        }
    }

    /// Takes at most one buffered message per sender, oldest first. The
    /// rest stay queued for the next step.
    pub fn drain_inbox(&self) -> Vec<OracleMessage> {
        let mut inbox = self.inbox.lock();
        let mut drained = Vec::new();
        inbox.retain(|_, queue| {
            if let Some(message) = queue.pop_front() {
                drained.push(message);
            }
            !queue.is_empty()
        });
        drained
    }

    #[cfg(test)]
    pub(crate) fn queued_for(&self, sender: &NodeAddress) -> usize {
        self.inbox
            .lock()
            .get(sender)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}

fn drop_reason(error: &SyncError) -> &'static str {
    match error {
        SyncError::MalformedMessage(_) => "malformed",
        SyncError::UnknownSender(_) => "unknown_sender",
        SyncError::SignatureVerificationFailure(_) => "invalid_signature",
        SyncError::BlobUnavailable(_) | SyncError::BlobStoreUnavailable => "unresolved_blob",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::time::Duration;

    use crate::blob::MemoryBlobStore;
    use crate::message::AvailabilityTable;

    struct NullClient;

    #[async_trait]
    impl TransportClient for NullClient {
        async fn broadcast(&self, _bytes: Bytes) -> SyncResult<()> {
            Ok(())
        }
    }

    fn transport_for_test(
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> (MessageTransport<NullClient>, Vec<OracleKeyPair>) {
        let (context, roster, keys) = Context::new_for_test(4);
        let context = Arc::new(context);
        let roster = Arc::new(OracleRoster::new(
            Arc::new(roster),
            Duration::from_secs(300),
        ));
        let transport = MessageTransport::new(
            context,
            keys[0].clone(),
            roster,
            Arc::new(NullClient),
            blob_store,
        );
        (transport, keys)
    }

    fn local_table_bytes(
        keypair: &OracleKeyPair,
        table: AvailabilityTable,
        tamper: bool,
    ) -> Bytes {
        let message = OracleMessage {
            sender: keypair.address(),
            stage: SyncState::SendLocalTable,
            payload: Payload::LocalTable {
                table: MaybeBlob::Inline(table),
            },
        };
        let mut envelope = SignedEnvelope::new(message, keypair);
        if tamper {
            envelope.message_mut().payload = Payload::LocalTable {
                table: MaybeBlob::Inline(
                    [(keypair.address(), 255)].into_iter().collect(),
                ),
            };
        }
        envelope.serialized().unwrap()
    }

    #[tokio::test]
    async fn verified_messages_reach_the_inbox() {
        let (transport, keys) = transport_for_test(None);
        let sender = &keys[1];
        let table: AvailabilityTable = [(sender.address(), 100)].into_iter().collect();

        transport
            .receive(local_table_bytes(sender, table.clone(), false))
            .await;

        let drained = transport.drain_inbox();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sender, sender.address());
        match &drained[0].payload {
            Payload::LocalTable { table: received } => {
                assert_eq!(received.inline(), Some(&table));
            }
            other => panic!("Unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_and_foreign_messages_are_dropped() {
        let (transport, keys) = transport_for_test(None);
        let table: AvailabilityTable = [(keys[1].address(), 100)].into_iter().collect();

        // A payload modified after signing.
        transport
            .receive(local_table_bytes(&keys[1], table.clone(), true))
            .await;
        // A sender outside the oracle roster.
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let stranger = OracleKeyPair::generate(&mut rng);
        transport
            .receive(local_table_bytes(&stranger, table, false))
            .await;
        // Garbage bytes.
        transport.receive(Bytes::from_static(b"not an envelope")).await;

        assert!(transport.drain_inbox().is_empty());
    }

    #[tokio::test]
    async fn inbox_is_bounded_per_sender_and_drains_fairly() {
        let (transport, keys) = transport_for_test(None);
        let spammer = &keys[1];
        let quiet = &keys[2];

        for value in 0..(PER_SENDER_INBOX_LIMIT + 10) {
            let table: AvailabilityTable =
                [(spammer.address(), (value % 256) as u8)].into_iter().collect();
            transport
                .receive(local_table_bytes(spammer, table, false))
                .await;
        }
        let table: AvailabilityTable = [(quiet.address(), 50)].into_iter().collect();
        transport
            .receive(local_table_bytes(quiet, table, false))
            .await;

        assert_eq!(transport.queued_for(&spammer.address()), PER_SENDER_INBOX_LIMIT);

        // One message per sender and step, regardless of backlog.
        let drained = transport.drain_inbox();
        assert_eq!(drained.len(), 2);
        let senders: Vec<_> = drained.iter().map(|m| m.sender).collect();
        assert!(senders.contains(&spammer.address()));
        assert!(senders.contains(&quiet.address()));

        // The overflow dropped the oldest: the first queued value is 10.
        let spammer_message = drained
            .iter()
            .find(|m| m.sender == spammer.address())
            .unwrap();
        match &spammer_message.payload {
            Payload::LocalTable { table } => {
                assert_eq!(table.inline().unwrap()[&spammer.address()], 10);
            }
            other => panic!("Unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn blob_payloads_resolve_on_receive() {
        let blob_store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let (transport, keys) = transport_for_test(Some(blob_store.clone()));
        let sender = &keys[1];
        let table: AvailabilityTable = [(sender.address(), 120)].into_iter().collect();

        let offloaded = MaybeBlob::offload(table.clone(), Some(&blob_store)).await;
        assert!(offloaded.blob_id().is_some());
        let message = OracleMessage {
            sender: sender.address(),
            stage: SyncState::SendLocalTable,
            payload: Payload::LocalTable { table: offloaded },
        };
        let envelope = SignedEnvelope::new(message, sender);
        transport.receive(envelope.serialized().unwrap()).await;

        let drained = transport.drain_inbox();
        assert_eq!(drained.len(), 1);
        match &drained[0].payload {
            Payload::LocalTable { table: received } => {
                assert_eq!(received.inline(), Some(&table));
            }
            other => panic!("Unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_blob_payload_is_dropped() {
        let blob_store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let (transport, keys) = transport_for_test(Some(blob_store));
        let sender = &keys[1];

        let message = OracleMessage {
            sender: sender.address(),
            stage: SyncState::SendLocalTable,
            payload: Payload::LocalTable {
                table: MaybeBlob::Blob("feedface".to_string()),
            },
        };
        let envelope = SignedEnvelope::new(message, sender);
        transport.receive(envelope.serialized().unwrap()).await;

        assert!(transport.drain_inbox().is_empty());
    }
}
