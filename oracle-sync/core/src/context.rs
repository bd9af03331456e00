// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use oracle_sync_config::{NodeAddress, Parameters};
#[cfg(test)]
use oracle_sync_config::OracleKeyPair;

use crate::epoch_clock::EpochClock;
#[cfg(test)]
use crate::metrics::test_metrics;
use crate::metrics::Metrics;

/// Context contains the configuration and metrics shared by all components
/// of this oracle node.
#[derive(Clone)]
pub struct Context {
    /// Network identity of this node.
    pub own_address: NodeAddress,
    /// Operational parameters of this node.
    pub parameters: Parameters,
    /// Epoch arithmetic derived from the configured genesis and length.
    pub clock: EpochClock,
    /// Metrics of this node.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(
        own_address: NodeAddress,
        parameters: Parameters,
        clock: EpochClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            own_address,
            parameters,
            clock,
            metrics,
        }
    }

    /// Create a test context with a deterministic roster of the given size.
    /// The context identifies as the first oracle of the roster.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        roster_size: usize,
    ) -> (
        Self,
        std::collections::BTreeSet<NodeAddress>,
        Vec<OracleKeyPair>,
    ) {
        let (roster, keypairs) = oracle_sync_config::local_roster_and_keys(roster_size);
        let parameters = Parameters::default();
        let clock = EpochClock::from_parameters(&parameters);
        let context = Self::new(
            keypairs[0].address(),
            parameters,
            clock,
            test_metrics(),
        );
        (context, roster, keypairs)
    }
}
