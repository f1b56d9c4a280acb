//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Keep-alive scope and handshake-deadline reaper
//!
//! Each listener tracks its not-yet-handed-over connections in a
//! [`KeepAliveScope`]. The accept pipeline inserts on accept and removes on
//! successful handover; the [`Reaper`] scans the scope periodically and
//! force-closes any connection still waiting past its deadline. Inserts,
//! scans and removals run concurrently with accepts and ticks.

use crate::metrics::ServerMetrics;
use crate::{Connection, ConnectionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-listener set of connections awaiting protocol handover
#[derive(Debug, Default)]
pub struct KeepAliveScope {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl KeepAliveScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted connection
    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// Drop a connection from the scope (handed over or closed)
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether the scope is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Collect connections past their deadline, pruning terminal entries
    fn sweep(&self, now: Instant) -> Vec<Arc<Connection>> {
        let mut expired = Vec::new();
        let mut stale = Vec::new();

        for entry in self.connections.iter() {
            let connection = entry.value();
            let state = connection.state();
            if state.is_pre_handover() {
                if now > connection.deadline() {
                    expired.push(connection.clone());
                }
            } else {
                // Handed over or already torn down; nothing left to watch.
                stale.push(*entry.key());
            }
        }

        for id in stale {
            self.connections.remove(&id);
        }
        expired
    }
}

/// Periodic task force-closing connections that missed their deadline
///
/// One reaper runs per listener, started with it and stopped with it.
#[derive(Debug)]
pub(crate) struct Reaper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Spawn a reaper over the given scope
    pub(crate) fn spawn(
        scope: Arc<KeepAliveScope>,
        interval: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }

                let expired = scope.sweep(Instant::now());
                if expired.is_empty() {
                    trace!(tracked = scope.len(), "reaper tick");
                    continue;
                }

                for connection in expired {
                    debug!(
                        connection_id = %connection.id(),
                        peer = %connection.peer_addr(),
                        state = %connection.state(),
                        "handshake deadline expired, force-closing"
                    );
                    scope.remove(connection.id());
                    metrics.connection_reaped();
                    connection.disconnect().await;
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stop the reaper and wait for its task to finish
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
