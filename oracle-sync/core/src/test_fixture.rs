// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process fixtures for protocol tests: a loopback network hub delivering
//! broadcasts between engines (optionally with duplication), a scripted
//! availability observer, and helpers to build whole oracle networks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use oracle_sync_config::{
    local_roster_and_keys, AvailabilityValue, Epoch, NodeAddress, OracleKeyPair, Parameters,
};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::context::Context;
use crate::engine::OracleSyncEngine;
use crate::epoch_clock::EpochClock;
use crate::error::SyncResult;
use crate::message::{AgreementSignature, AgreementSignatures, AvailabilityTable};
use crate::metrics::initialize_metrics;
use crate::roster::OracleRoster;
use crate::store::{AvailabilityObserver, AvailabilityStore};
use crate::transport::{MessageTransport, TransportClient};

/// Delivers every broadcast to every other registered transport, in a
/// shuffled order, duplicating each delivery with the configured
/// probability. Determinism comes from the seeded generator.
pub(crate) struct LoopbackHub {
    peers: Mutex<Vec<(NodeAddress, Arc<MessageTransport<LoopbackClient>>)>>,
    duplicate_probability: f64,
    rng: Mutex<StdRng>,
}

impl LoopbackHub {
    pub(crate) fn new(duplicate_probability: f64) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            duplicate_probability,
            rng: Mutex::new(StdRng::from_seed([42; 32])),
        })
    }

    fn register(
        &self,
        address: NodeAddress,
        transport: Arc<MessageTransport<LoopbackClient>>,
    ) {
        self.peers.lock().push((address, transport));
    }

    async fn deliver(&self, from: NodeAddress, bytes: Bytes) {
        let mut targets: Vec<_> = self
            .peers
            .lock()
            .iter()
            .filter(|(address, _)| *address != from)
            .cloned()
            .collect();
        let copies: Vec<usize> = {
            let mut rng = self.rng.lock();
            // Shuffle by picking a removal order.
            let mut shuffled = Vec::with_capacity(targets.len());
            while !targets.is_empty() {
                let index = rng.gen_range(0..targets.len());
                shuffled.push(targets.swap_remove(index));
            }
            targets = shuffled;
            targets
                .iter()
                .map(|_| {
                    if rng.gen_bool(self.duplicate_probability) {
                        2
                    } else {
                        1
                    }
                })
                .collect()
        };
        for ((_, transport), copies) in targets.into_iter().zip(copies) {
            for _ in 0..copies {
                transport.receive(bytes.clone()).await;
            }
        }
    }
}

pub(crate) struct LoopbackClient {
    hub: Arc<LoopbackHub>,
    own_address: NodeAddress,
}

#[async_trait]
impl TransportClient for LoopbackClient {
    async fn broadcast(&self, bytes: Bytes) -> SyncResult<()> {
        self.hub.deliver(self.own_address, bytes).await;
        Ok(())
    }
}

/// Scripted stand-in for the network monitor feeding the engine.
pub(crate) struct TestObserver {
    values: Mutex<BTreeMap<NodeAddress, AvailabilityValue>>,
    uptime: Mutex<(u64, u64)>,
}

impl TestObserver {
    pub(crate) fn new(values: BTreeMap<NodeAddress, AvailabilityValue>) -> Self {
        Self {
            values: Mutex::new(values),
            uptime: Mutex::new((0, 0)),
        }
    }

    pub(crate) fn set_value(&self, node: NodeAddress, value: AvailabilityValue) {
        self.values.lock().insert(node, value);
    }
}

impl AvailabilityObserver for TestObserver {
    fn known_nodes(&self) -> Vec<NodeAddress> {
        self.values.lock().keys().copied().collect()
    }

    fn previous_epoch_value(&self, node: &NodeAddress) -> AvailabilityValue {
        self.values.lock().get(node).copied().unwrap_or(0)
    }

    fn current_epoch_uptime(&self) -> (u64, u64) {
        *self.uptime.lock()
    }
}

pub(crate) struct OracleFixture {
    pub engine: OracleSyncEngine<LoopbackClient>,
    pub address: NodeAddress,
    pub keypair: OracleKeyPair,
    pub store: Arc<RwLock<AvailabilityStore>>,
    pub observer: Arc<TestObserver>,
}

/// Test parameters tuned for paused-time runs: short send intervals and
/// periods, and a genesis placed so that the wall clock currently sits in
/// the middle of the given epoch.
pub(crate) fn test_parameters(current_epoch: Epoch) -> Parameters {
    let epoch_secs = 3_600;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    Parameters {
        epoch_genesis_unix_secs: now - current_epoch * epoch_secs - epoch_secs / 2,
        epoch_duration: Duration::from_secs(epoch_secs),
        send_interval: Duration::from_secs(1),
        send_period: Duration::from_secs(4),
        ..Parameters::default()
    }
}

/// Builds a network of engines wired through one loopback hub. Every oracle
/// initially observes every other oracle (itself included) at the given
/// availability value.
pub(crate) fn build_network(
    size: usize,
    parameters: Parameters,
    duplicate_probability: f64,
    shared_blob_store: Option<Arc<dyn BlobStore>>,
) -> Vec<OracleFixture> {
    build_network_with_values(
        size,
        parameters,
        duplicate_probability,
        shared_blob_store,
        crate::constants::FULL_AVAILABILITY_THRESHOLD + 1,
    )
}

pub(crate) fn build_network_with_values(
    size: usize,
    parameters: Parameters,
    duplicate_probability: f64,
    shared_blob_store: Option<Arc<dyn BlobStore>>,
    initial_value: AvailabilityValue,
) -> Vec<OracleFixture> {
    let (roster, keypairs) = local_roster_and_keys(size);
    let hub = LoopbackHub::new(duplicate_probability);

    let mut fixtures = Vec::new();
    for keypair in keypairs {
        let address = keypair.address();
        let clock = EpochClock::from_parameters(&parameters);
        let context = Arc::new(Context::new(
            address,
            parameters.clone(),
            clock,
            initialize_metrics(&prometheus::Registry::new()),
        ));
        let roster_handle = Arc::new(OracleRoster::new(
            Arc::new(roster.clone()),
            parameters.oracle_list_refresh_interval,
        ));
        let transport = Arc::new(MessageTransport::new(
            context.clone(),
            keypair.clone(),
            roster_handle.clone(),
            Arc::new(LoopbackClient {
                hub: hub.clone(),
                own_address: address,
            }),
            shared_blob_store.clone(),
        ));
        hub.register(address, transport.clone());

        let store = Arc::new(RwLock::new(AvailabilityStore::new(None)));
        let observer = Arc::new(TestObserver::new(
            roster.iter().map(|oracle| (*oracle, initial_value)).collect(),
        ));
        let engine = OracleSyncEngine::new(
            context,
            keypair.clone(),
            transport,
            roster_handle,
            store.clone(),
            observer.clone() as Arc<dyn AvailabilityObserver>,
            shared_blob_store.clone(),
        );
        fixtures.push(OracleFixture {
            engine,
            address,
            keypair,
            store,
            observer,
        });
    }
    fixtures
}

/// Steps every engine once per iteration, advancing the paused clock between
/// iterations.
pub(crate) async fn run_steps(oracles: &mut [OracleFixture], iterations: usize) {
    for _ in 0..iterations {
        for oracle in oracles.iter_mut() {
            oracle.engine.step().await;
        }
        tokio::time::advance(Duration::from_millis(200)).await;
    }
}

/// A settled epoch: a table over the given nodes and agreement signatures by
/// all the given signers.
pub(crate) fn settled_epoch(
    epoch: Epoch,
    table: AvailabilityTable,
    signers: &[&OracleKeyPair],
) -> (AvailabilityTable, AgreementSignatures) {
    let signatures = signers
        .iter()
        .map(|keypair| {
            (
                keypair.address(),
                AgreementSignature::new(&table, epoch, keypair),
            )
        })
        .collect();
    (table, signatures)
}

/// Shared in-memory blob store for networks that exercise offload.
pub(crate) fn shared_blob_store() -> Arc<dyn BlobStore> {
    Arc::new(MemoryBlobStore::new())
}
