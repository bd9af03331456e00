// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operational configurations of an oracle sync node.
///
/// All fields should tolerate inconsistencies among oracles, without affecting
/// safety of the protocol: timeouts and intervals shape how fast agreement is
/// reached, never what is agreed on.
///
/// NOTE: default values should make sense, so most operators should not need
/// to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Start of epoch 0, as a unix timestamp in seconds.
    #[serde(default = "Parameters::default_epoch_genesis_unix_secs")]
    pub epoch_genesis_unix_secs: u64,

    /// Fixed wall-clock length of every epoch.
    #[serde(default = "Parameters::default_epoch_duration")]
    pub epoch_duration: Duration,

    /// Minimum time between re-broadcasts within a sending phase.
    #[serde(default = "Parameters::default_send_interval")]
    pub send_interval: Duration,

    /// Base timeout of a sending phase, measured from its first send.
    /// Individual phases scale this with their own multipliers.
    #[serde(default = "Parameters::default_send_period")]
    pub send_period: Duration,

    /// Cache lifetime of the oracle roster snapshot.
    #[serde(default = "Parameters::default_oracle_list_refresh_interval")]
    pub oracle_list_refresh_interval: Duration,

    /// Cadence at which the engine task performs one state machine step.
    #[serde(default = "Parameters::default_process_delay")]
    pub process_delay: Duration,

    /// How often the node logs its own projected end-of-epoch availability
    /// while waiting for the epoch to change.
    #[serde(default = "Parameters::default_self_assessment_interval")]
    pub self_assessment_interval: Duration,

    /// Offload historical epoch responses to the content-addressed blob
    /// store, sending identifiers instead of full tables.
    #[serde(default)]
    pub use_blob_offload: bool,

    /// Offload consensus-phase payloads (local and median tables) to the
    /// blob store. Independent from `use_blob_offload`.
    #[serde(default)]
    pub use_blob_offload_during_consensus: bool,

    /// Replace repeated node address keys in historical responses with small
    /// integer ids, shipping the substitution map alongside.
    #[serde(default = "Parameters::default_squeeze_epoch_dictionaries")]
    pub squeeze_epoch_dictionaries: bool,

    /// Verbose protocol logging. No protocol effect.
    #[serde(default = "Parameters::default_debug_sync")]
    pub debug_sync: bool,

    /// Full payload dumps in protocol logging. No protocol effect.
    #[serde(default)]
    pub debug_sync_full: bool,
}

impl Parameters {
    pub fn default_epoch_genesis_unix_secs() -> u64 {
        0
    }

    pub fn default_epoch_duration() -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    pub fn default_send_interval() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_send_period() -> Duration {
        Duration::from_secs(90)
    }

    pub fn default_oracle_list_refresh_interval() -> Duration {
        Duration::from_secs(300)
    }

    pub fn default_process_delay() -> Duration {
        Duration::from_secs(1)
    }

    pub fn default_self_assessment_interval() -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub fn default_squeeze_epoch_dictionaries() -> bool {
        true
    }

    pub fn default_debug_sync() -> bool {
        true
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            epoch_genesis_unix_secs: Parameters::default_epoch_genesis_unix_secs(),
            epoch_duration: Parameters::default_epoch_duration(),
            send_interval: Parameters::default_send_interval(),
            send_period: Parameters::default_send_period(),
            oracle_list_refresh_interval: Parameters::default_oracle_list_refresh_interval(),
            process_delay: Parameters::default_process_delay(),
            self_assessment_interval: Parameters::default_self_assessment_interval(),
            use_blob_offload: false,
            use_blob_offload_during_consensus: false,
            squeeze_epoch_dictionaries: Parameters::default_squeeze_epoch_dictionaries(),
            debug_sync: Parameters::default_debug_sync(),
            debug_sync_full: false,
        }
    }
}
