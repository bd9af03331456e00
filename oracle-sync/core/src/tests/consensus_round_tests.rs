// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs of the consensus round over the loopback network.

use std::collections::BTreeMap;

use oracle_sync_config::{NodeAddress, OracleKeyPair};
use rand::{rngs::StdRng, SeedableRng};

use crate::constants::FULL_AVAILABILITY_THRESHOLD;
use crate::engine::SyncState;
use crate::message::{MedianTable, SignedMedianEntry};
use crate::test_fixture::{
    build_network, run_steps, shared_blob_store, test_parameters, OracleFixture,
};

fn regular_node() -> NodeAddress {
    let mut rng = StdRng::seed_from_u64(4242);
    OracleKeyPair::generate(&mut rng).address()
}

/// Starts a round for epoch 1 on every given engine: the engines believe the
/// epoch just changed from 1 to 2.
fn enter_round(oracles: &mut [OracleFixture]) {
    for oracle in oracles.iter_mut() {
        oracle.engine.force_state(SyncState::WaitForEpochChange);
        oracle.engine.force_round_epoch(1);
    }
}

fn assert_settled_epoch_1(
    oracles: &[OracleFixture],
    expected_table_len: usize,
    expected_signatures: usize,
) {
    let reference = oracles[0].store.read().get_epoch(1).cloned().unwrap();
    for oracle in oracles {
        let store = oracle.store.read();
        assert_eq!(store.last_synced_epoch(), 1);
        let record = store.get_epoch(1).unwrap();
        assert!(record.valid);
        assert_eq!(record.table.len(), expected_table_len);
        assert_eq!(record.signatures.len(), expected_signatures);
        for signature in record.signatures.values() {
            assert!(signature.verify(&record.table, 1).is_ok());
        }
        // Identical agreed bytes on every oracle.
        assert_eq!(
            bcs::to_bytes(&record.table).unwrap(),
            bcs::to_bytes(&reference.table).unwrap()
        );
        assert_eq!(oracle.engine.state(), SyncState::WaitForEpochChange);
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn three_oracles_settle_the_finished_epoch() {
    let mut oracles = build_network(3, test_parameters(2), 0.0, None);
    let n_x = regular_node();
    for oracle in &oracles {
        oracle.observer.set_value(n_x, 40);
    }
    enter_round(&mut oracles);

    run_steps(&mut oracles, 150).await;

    assert_settled_epoch_1(&oracles, 4, 3);
    let record = oracles[0].store.read().get_epoch(1).cloned().unwrap();
    assert_eq!(record.table[&n_x], 40);
    for oracle in &oracles {
        assert_eq!(record.table[&oracle.address], FULL_AVAILABILITY_THRESHOLD + 1);
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn duplicated_and_reordered_delivery_changes_nothing() {
    // Every broadcast is delivered in a shuffled order and duplicated with
    // 50% probability. The settled record must match the clean run.
    let mut oracles = build_network(3, test_parameters(2), 0.5, None);
    let n_x = regular_node();
    for oracle in &oracles {
        oracle.observer.set_value(n_x, 40);
    }
    enter_round(&mut oracles);

    run_steps(&mut oracles, 150).await;

    assert_settled_epoch_1(&oracles, 4, 3);
    let record = oracles[0].store.read().get_epoch(1).cloned().unwrap();
    assert_eq!(record.table[&n_x], 40);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn below_threshold_oracle_catches_up_from_its_peers() {
    let mut oracles = build_network(3, test_parameters(2), 0.0, None);
    // The last oracle missed too much of the finished epoch, as everyone
    // observed.
    let laggard = oracles[2].address;
    for oracle in &oracles {
        oracle
            .observer
            .set_value(laggard, FULL_AVAILABILITY_THRESHOLD - 1);
    }
    enter_round(&mut oracles);

    run_steps(&mut oracles, 200).await;

    // Two participants settled the epoch themselves, the laggard imported
    // the identical record through the request branch.
    assert_settled_epoch_1(&oracles, 3, 2);
    let record = oracles[2].store.read().get_epoch(1).cloned().unwrap();
    assert_eq!(record.table[&laggard], FULL_AVAILABILITY_THRESHOLD - 1);
    assert!(!record.signatures.contains_key(&laggard));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn single_oracle_settles_an_epoch_alone() {
    let mut oracles = build_network(1, test_parameters(2), 0.0, None);
    enter_round(&mut oracles);

    run_steps(&mut oracles, 100).await;

    assert_settled_epoch_1(&oracles, 1, 1);
    let record = oracles[0].store.read().get_epoch(1).cloned().unwrap();
    assert!(record.signatures.contains_key(&oracles[0].address));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn consensus_payloads_travel_through_the_blob_store() {
    let blob_store = shared_blob_store();
    let mut parameters = test_parameters(2);
    parameters.use_blob_offload_during_consensus = true;
    let mut oracles = build_network(3, parameters, 0.0, Some(blob_store));
    let n_x = regular_node();
    for oracle in &oracles {
        oracle.observer.set_value(n_x, 40);
    }
    enter_round(&mut oracles);

    run_steps(&mut oracles, 150).await;

    assert_settled_epoch_1(&oracles, 4, 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn mid_round_dropout_ends_in_a_faulty_epoch() {
    let mut oracles = build_network(2, test_parameters(2), 0.0, None);
    enter_round(&mut oracles);

    // Both oracles announce; the second goes silent before the local table
    // exchange begins.
    run_steps(&mut oracles, 11).await;
    for _ in 0..180 {
        oracles[0].engine.step().await;
        tokio::time::advance(std::time::Duration::from_millis(200)).await;
    }

    // The survivor cannot reach a median quorum alone against two expected
    // participants, falls back to requesting the epoch, gets no answer, and
    // records the epoch as faulty.
    let store = oracles[0].store.read();
    assert_eq!(store.last_synced_epoch(), 1);
    assert!(!store.get_epoch(1).unwrap().valid);
    drop(store);
    assert_eq!(oracles[0].engine.state(), SyncState::WaitForEpochChange);
    assert!(
        oracles[0]
            .engine
            .context()
            .metrics
            .node_metrics
            .rounds_abandoned
            .get()
            >= 1
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn divergent_median_is_outvoted() {
    let mut oracles = build_network(3, test_parameters(2), 0.0, None);
    let honest_a = oracles[0].keypair.clone();
    let honest_b = oracles[1].keypair.clone();
    let divergent = oracles[2].keypair.clone();
    let n_x = regular_node();

    let engine = &mut oracles[0].engine;
    engine.force_round_epoch(2);
    for keypair in [&honest_a, &honest_b, &divergent] {
        engine
            .round
            .is_participating
            .insert(keypair.address(), true);
    }
    let median_of = |keypair: &OracleKeyPair, value| -> MedianTable {
        [(n_x, SignedMedianEntry::new(value, 1, n_x, keypair))]
            .into_iter()
            .collect()
    };
    engine
        .round
        .received_median_tables
        .insert(honest_a.address(), median_of(&honest_a, 40));
    engine
        .round
        .received_median_tables
        .insert(honest_b.address(), median_of(&honest_b, 40));
    engine
        .round
        .received_median_tables
        .insert(divergent.address(), median_of(&divergent, 90));

    engine.compute_agreed_table().unwrap();

    // The honest majority outvotes the divergent entry.
    let agreed: BTreeMap<_, _> = engine.round.agreed_table.clone().unwrap();
    assert_eq!(agreed, [(n_x, 40)].into_iter().collect());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn contested_node_without_majority_abandons_the_round() {
    let mut oracles = build_network(3, test_parameters(2), 0.0, None);
    let keys: Vec<_> = oracles.iter().map(|oracle| oracle.keypair.clone()).collect();
    let n_x = regular_node();

    let engine = &mut oracles[0].engine;
    engine.force_round_epoch(2);
    for (keypair, value) in keys.iter().zip([40u8, 90, 200]) {
        engine
            .round
            .is_participating
            .insert(keypair.address(), true);
        engine.round.received_median_tables.insert(
            keypair.address(),
            [(n_x, SignedMedianEntry::new(value, 1, n_x, keypair))]
                .into_iter()
                .collect(),
        );
    }

    engine.compute_agreed_table().unwrap();
    assert!(engine.round.agreed_table.is_none());
}
