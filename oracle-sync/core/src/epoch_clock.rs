// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use oracle_sync_config::{Epoch, Parameters};

/// Derives epoch indexes from wall-clock time.
///
/// Epochs are fixed-length intervals anchored at a fixed genesis instant.
/// The engine only ever consumes these derived views; it never manipulates
/// timestamps directly.
#[derive(Clone)]
pub struct EpochClock {
    genesis_unix_secs: u64,
    epoch_length: Duration,
}

impl EpochClock {
    pub fn new(genesis_unix_secs: u64, epoch_length: Duration) -> Self {
        assert!(
            epoch_length.as_secs() > 0,
            "Epoch length must be at least one second"
        );
        Self {
            genesis_unix_secs,
            epoch_length,
        }
    }

    pub fn from_parameters(parameters: &Parameters) -> Self {
        Self::new(parameters.epoch_genesis_unix_secs, parameters.epoch_duration)
    }

    pub fn epoch_length(&self) -> Duration {
        self.epoch_length
    }

    /// The epoch containing the given instant. Instants before genesis are
    /// reported as epoch 0.
    pub fn epoch_at(&self, unix_secs: u64) -> Epoch {
        unix_secs.saturating_sub(self.genesis_unix_secs) / self.epoch_length.as_secs()
    }

    /// The epoch containing the current instant.
    pub fn current_epoch(&self) -> Epoch {
        self.epoch_at(now_unix_secs())
    }

    /// The last completed epoch. None while still inside epoch 0, which has
    /// no completed predecessor.
    pub fn previous_epoch(&self) -> Option<Epoch> {
        self.current_epoch().checked_sub(1)
    }

    /// Unix timestamp in seconds at which the given epoch ends.
    pub fn epoch_end_unix_secs(&self, epoch: Epoch) -> u64 {
        self.genesis_unix_secs + (epoch + 1) * self.epoch_length.as_secs()
    }

    /// How much of the current epoch has already passed, in [0, 1).
    pub fn fraction_of_current_epoch_elapsed(&self) -> f64 {
        let now = now_unix_secs();
        let into_epoch = now.saturating_sub(self.genesis_unix_secs) % self.epoch_length.as_secs();
        into_epoch as f64 / self.epoch_length.as_secs() as f64
    }

    /// Wall-clock time left until the current epoch ends.
    pub fn time_left_in_current_epoch(&self) -> Duration {
        let end = self.epoch_end_unix_secs(self.current_epoch());
        Duration::from_secs(end.saturating_sub(now_unix_secs()))
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Clock is set before the unix epoch")
        .as_secs()
}
