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

//! Lock-free metrics for the server
//!
//! All metrics are stored as atomics and can be accessed concurrently
//! without locks. The same events are also emitted through the `metrics`
//! facade so an installed recorder sees them; no recorder is installed by
//! the library itself.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free server metrics
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,

    // Handshake outcomes
    handshakes_accepted: AtomicU64,
    handshakes_rejected: AtomicU64,

    // Errors
    accept_errors: AtomicU64,
    connection_errors: AtomicU64,

    // Liveness enforcement
    reaped_connections: AtomicU64,
    heartbeat_disconnects: AtomicU64,

    // Server start time
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            handshakes_accepted: AtomicU64::new(0),
            handshakes_rejected: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            reaped_connections: AtomicU64::new(0),
            heartbeat_disconnects: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a new connection being accepted
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.connections.total").increment(1);
        gauge!("switchyard.connections.active").increment(1.0);
    }

    /// Record a connection being closed
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauge!("switchyard.connections.active").decrement(1.0);
    }

    /// Record a successful protocol handshake
    pub fn handshake_accepted(&self) {
        self.handshakes_accepted.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.handshakes.accepted").increment(1);
    }

    /// Record a connection no protocol claimed
    pub fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.handshakes.rejected").increment(1);
    }

    /// Record a failed accept attempt
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.errors.accept").increment(1);
    }

    /// Record a per-connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.errors.connection").increment(1);
    }

    /// Record a connection force-closed by the keep-alive reaper
    pub fn connection_reaped(&self) {
        self.reaped_connections.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.connections.reaped").increment(1);
    }

    /// Record a connection dropped for missing a heartbeat
    pub fn heartbeat_disconnect(&self) {
        self.heartbeat_disconnects.fetch_add(1, Ordering::Relaxed);
        counter!("switchyard.connections.heartbeat_dropped").increment(1);
    }

    /// Total connections accepted since start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Currently live connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Accepted handshakes since start
    pub fn handshakes_accepted(&self) -> u64 {
        self.handshakes_accepted.load(Ordering::Relaxed)
    }

    /// Rejected handshakes since start
    pub fn handshakes_rejected(&self) -> u64 {
        self.handshakes_rejected.load(Ordering::Relaxed)
    }

    /// Accept errors since start
    pub fn accept_errors(&self) -> u64 {
        self.accept_errors.load(Ordering::Relaxed)
    }

    /// Per-connection errors since start
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Connections reaped for missing the handshake deadline
    pub fn reaped_connections(&self) -> u64 {
        self.reaped_connections.load(Ordering::Relaxed)
    }

    /// Connections dropped for missing a heartbeat
    pub fn heartbeat_disconnects(&self) -> u64 {
        self.heartbeat_disconnects.load(Ordering::Relaxed)
    }

    /// When the metrics (and the server) started
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = ServerMetrics::new();
        assert_eq!(metrics.total_connections(), 0);
        assert_eq!(metrics.active_connections(), 0);

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 2);

        metrics.connection_closed();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_handshake_counters() {
        let metrics = ServerMetrics::new();
        metrics.handshake_accepted();
        metrics.handshake_rejected();
        metrics.handshake_rejected();
        assert_eq!(metrics.handshakes_accepted(), 1);
        assert_eq!(metrics.handshakes_rejected(), 2);
    }

    #[test]
    fn test_liveness_counters() {
        let metrics = ServerMetrics::new();
        metrics.connection_reaped();
        metrics.heartbeat_disconnect();
        assert_eq!(metrics.reaped_connections(), 1);
        assert_eq!(metrics.heartbeat_disconnects(), 1);
    }
}
