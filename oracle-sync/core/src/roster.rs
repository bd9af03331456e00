// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use oracle_sync_config::NodeAddress;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SyncResult;

/// Source of truth for the privileged oracle set, typically a ledger or an
/// on-chain contract. Fetches may be slow or fail; the roster caches around
/// that.
pub trait OracleRegistry: Send + Sync + 'static {
    fn fetch_oracles(&self) -> SyncResult<BTreeSet<NodeAddress>>;
}

/// A fixed oracle set, useful for tests and local deployments.
impl OracleRegistry for BTreeSet<NodeAddress> {
    fn fetch_oracles(&self) -> SyncResult<BTreeSet<NodeAddress>> {
        Ok(self.clone())
    }
}

/// Cached view of the current oracle set.
///
/// The registry is consulted at most once per refresh interval. On fetch
/// failure, and on an empty fetch result, the previous snapshot is retained
/// and another attempt is scheduled for the next interval.
pub struct OracleRoster {
    registry: Arc<dyn OracleRegistry>,
    refresh_interval: Duration,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    oracles: BTreeSet<NodeAddress>,
    last_refresh: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl OracleRoster {
    pub fn new(registry: Arc<dyn OracleRegistry>, refresh_interval: Duration) -> Self {
        let roster = Self {
            registry,
            refresh_interval,
            inner: RwLock::new(Inner::default()),
        };
        roster.maybe_refresh();
        roster
    }

    /// Refreshes the cached oracle set if the refresh interval has passed
    /// since the last attempt.
    pub fn maybe_refresh(&self) {
        {
            let inner = self.inner.read();
            if let Some(last_attempt) = inner.last_attempt {
                if last_attempt.elapsed() < self.refresh_interval {
                    return;
                }
            }
        }

        let mut inner = self.inner.write();
        inner.last_attempt = Some(Instant::now());
        match self.registry.fetch_oracles() {
            Ok(oracles) if oracles.is_empty() => {
                warn!("Oracle registry returned an empty set, keeping the previous snapshot");
            }
            Ok(oracles) => {
                debug!("Refreshed oracle roster, {} oracles known", oracles.len());
                inner.oracles = oracles;
                inner.last_refresh = Some(Instant::now());
            }
            Err(error) => {
                warn!("Failed to refresh the oracle roster: {error:?}");
            }
        }
    }

    pub fn current_oracles(&self) -> BTreeSet<NodeAddress> {
        self.inner.read().oracles.clone()
    }

    pub fn is_oracle(&self, address: &NodeAddress) -> bool {
        self.inner.read().oracles.contains(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().oracles.is_empty()
    }
}
