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

//! Heartbeat manager: periodic ping/pong across connected sockets
//!
//! Participation is opt-in per protocol. Each tick, every registered
//! connection either proves liveness (recent application activity with the
//! smart health check on), answers for an outstanding ping (an unanswered
//! ping from the previous tick disconnects it), or receives a new ping
//! through its protocol socket. Pong receipt reaches the manager indirectly:
//! the protocol layer calls [`Connection::keep_alive`], which clears the
//! outstanding-ping flag.

use crate::metrics::ServerMetrics;
use crate::{Connection, ConnectionId};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Process-wide set of heartbeat participants
#[derive(Debug, Default)]
pub struct HeartbeatScope {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl HeartbeatScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected socket for heartbeat
    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// Unregister a connection
    pub fn remove(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether the scope is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn participants(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Periodic ping/pong scheduler
#[derive(Debug)]
pub(crate) struct HeartbeatManager {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatManager {
    /// Spawn the heartbeat task with the given cadence
    pub(crate) fn spawn(
        scope: Arc<HeartbeatScope>,
        interval: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly connected
            // sockets get a full interval before their first ping.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                Self::tick(&scope, interval, &metrics).await;
            }
        });

        Self { shutdown, handle }
    }

    async fn tick(scope: &HeartbeatScope, interval: Duration, metrics: &ServerMetrics) {
        let mut pings = Vec::new();

        for connection in scope.participants() {
            if connection.is_closed() {
                scope.remove(connection.id());
                continue;
            }

            if connection.smart_health_check() && connection.last_activity().elapsed() < interval {
                trace!(connection_id = %connection.id(), "recent activity, ping suppressed");
                continue;
            }

            if connection.pong_required() {
                debug!(
                    connection_id = %connection.id(),
                    peer = %connection.peer_addr(),
                    "ping unanswered, disconnecting"
                );
                scope.remove(connection.id());
                metrics.heartbeat_disconnect();
                connection.disconnect().await;
                continue;
            }

            pings.push(async move {
                let Some(socket) = connection.socket() else {
                    return;
                };
                if socket.ping().await {
                    connection.mark_ping_sent();
                } else {
                    // Failed ping writes already disconnect the connection.
                    debug!(connection_id = %connection.id(), "ping write failed");
                }
            });
        }

        join_all(pings).await;
    }

    /// Stop the heartbeat and wait for its task to finish
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
