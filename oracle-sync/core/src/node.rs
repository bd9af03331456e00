// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::engine::OracleSyncEngine;
use crate::transport::TransportClient;

/// Handle to stop the engine task. The stop signal is observed at step
/// boundaries; a step in flight completes first.
pub struct OracleSyncHandle {
    step_task: JoinHandle<()>,
    tx_shutdown: oneshot::Sender<()>,
}

impl OracleSyncHandle {
    pub async fn stop(self) {
        let _ = self.tx_shutdown.send(());
        if let Err(error) = self.step_task.await {
            if error.is_panic() {
                std::panic::resume_unwind(error.into_panic());
            }
        }
    }
}

/// Drives an engine at the configured step cadence until stopped.
pub struct OracleSyncNode;

impl OracleSyncNode {
    pub fn start<C: TransportClient>(mut engine: OracleSyncEngine<C>) -> OracleSyncHandle {
        let (tx_shutdown, mut rx_shutdown) = oneshot::channel();
        let process_delay = engine.context().parameters.process_delay;
        let step_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(process_delay);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.step().await;
                    }
                    _ = &mut rx_shutdown => {
                        info!("Oracle sync node shutting down ...");
                        return;
                    }
                }
            }
        });
        OracleSyncHandle {
            step_task,
            tx_shutdown,
        }
    }
}
