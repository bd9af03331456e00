// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use rand::{rngs::StdRng, SeedableRng};

use crate::{NodeAddress, OracleKeyPair};

/// Creates a deterministic local roster of the given size, returning the set
/// of oracle addresses together with the keypairs they are derived from.
/// Keys are generated from a fixed seed so tests are reproducible.
pub fn local_roster_and_keys(size: usize) -> (BTreeSet<NodeAddress>, Vec<OracleKeyPair>) {
    let mut rng = StdRng::from_seed([0; 32]);
    let keypairs: Vec<_> = (0..size)
        .map(|_| OracleKeyPair::generate(&mut rng))
        .collect();
    let roster = keypairs.iter().map(|keypair| keypair.address()).collect();
    (roster, keypairs)
}
