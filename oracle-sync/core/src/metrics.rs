// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

pub struct Metrics {
    pub node_metrics: NodeMetrics,
}

pub fn initialize_metrics(registry: &Registry) -> Arc<Metrics> {
    Arc::new(Metrics {
        node_metrics: NodeMetrics::new(registry),
    })
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    initialize_metrics(&Registry::new())
}

pub struct NodeMetrics {
    pub current_state: IntGauge,
    pub last_synced_epoch: IntGauge,
    pub rounds_completed: IntCounter,
    pub rounds_abandoned: IntCounter,
    pub epochs_marked_faulty: IntCounter,
    pub messages_broadcast: IntCounterVec,
    pub messages_accepted: IntCounterVec,
    pub messages_dropped: IntCounterVec,
    pub inbox_overflow: IntCounter,
    pub historical_requests_served: IntCounter,
    pub blob_offload_fallbacks: IntCounter,
}

impl NodeMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            current_state: register_int_gauge_with_registry!(
                "current_state",
                "Index of the state the sync state machine is currently in",
                registry,
            )
            .unwrap(),
            last_synced_epoch: register_int_gauge_with_registry!(
                "last_synced_epoch",
                "Highest epoch with a settled availability record",
                registry,
            )
            .unwrap(),
            rounds_completed: register_int_counter_with_registry!(
                "rounds_completed",
                "Number of consensus rounds that reached persistence",
                registry,
            )
            .unwrap(),
            rounds_abandoned: register_int_counter_with_registry!(
                "rounds_abandoned",
                "Number of consensus rounds abandoned for lack of quorum",
                registry,
            )
            .unwrap(),
            epochs_marked_faulty: register_int_counter_with_registry!(
                "epochs_marked_faulty",
                "Number of epochs recorded without a reached consensus",
                registry,
            )
            .unwrap(),
            messages_broadcast: register_int_counter_vec_with_registry!(
                "messages_broadcast",
                "Number of messages broadcast to the other oracles, by stage",
                &["stage"],
                registry,
            )
            .unwrap(),
            messages_accepted: register_int_counter_vec_with_registry!(
                "messages_accepted",
                "Number of inbound messages accepted into the inbox, by stage",
                &["stage"],
                registry,
            )
            .unwrap(),
            messages_dropped: register_int_counter_vec_with_registry!(
                "messages_dropped",
                "Number of inbound messages dropped, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            inbox_overflow: register_int_counter_with_registry!(
                "inbox_overflow",
                "Number of buffered messages evicted by per-sender inbox caps",
                registry,
            )
            .unwrap(),
            historical_requests_served: register_int_counter_with_registry!(
                "historical_requests_served",
                "Number of historical agreement requests answered",
                registry,
            )
            .unwrap(),
            blob_offload_fallbacks: register_int_counter_with_registry!(
                "blob_offload_fallbacks",
                "Number of payloads embedded inline after a blob store failure",
                registry,
            )
            .unwrap(),
        }
    }
}
