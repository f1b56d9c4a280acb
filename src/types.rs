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

//! Core types for the server framework

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state (stored as atomic u8 for lock-free state management)
///
/// States advance strictly forward: `Pending` through `Closed`. A connection
/// never returns to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted; transport configuration and TLS wrap in progress
    Pending = 0,
    /// Protocol discovery against the registry in progress
    Handshaking = 1,
    /// A protocol accepted the connection and owns its lifecycle
    Connected = 2,
    /// Teardown in progress
    Closing = 3,
    /// Connection is closed; terminal
    Closed = 4,
}

impl ConnectionState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Handshaking,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the connection is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Check if the connection is still waiting for a protocol to claim it
    pub fn is_pre_handover(self) -> bool {
        matches!(self, Self::Pending | Self::Handshaking)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Connection information snapshot (for non-blocking queries)
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Current state
    pub state: ConnectionState,
    /// Peer address
    pub peer_addr: SocketAddr,
    /// Whether the transport is TLS-wrapped
    pub secure: bool,
    /// Name of the installed protocol, if any
    pub protocol: Option<String>,
    /// When the connection was created
    pub created_at: Instant,
    /// Last activity timestamp
    pub last_activity: Instant,
}

impl ConnectionInfo {
    /// Get the connection duration
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Get the idle duration
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Server snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Number of live connections known to the server
    pub active_connections: usize,
    /// Total connections accepted since server start
    pub total_connections: u64,
    /// Addresses of the bound listeners
    pub listeners: Vec<SocketAddr>,
    /// Server uptime
    pub uptime: Duration,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server {{ active: {}, total: {}, listeners: {:?}, uptime: {:?} }}",
            self.active_connections, self.total_connections, self.listeners, self.uptime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id1 = ConnectionId::new(1);
        let id2 = ConnectionId::new(2);

        assert_eq!(id1.as_u64(), 1);
        assert_eq!(id2.as_u64(), 2);
        assert_ne!(id1, id2);
        assert!(id1 < id2);
        assert_eq!(id1.to_string(), "conn-1");
    }

    #[test]
    fn test_connection_state_conversion() {
        for state in [
            ConnectionState::Pending,
            ConnectionState::Handshaking,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            let as_u8 = state.as_u8();
            let back = ConnectionState::from_u8(as_u8);
            assert_eq!(state, back);
        }
    }

    #[test]
    fn test_connection_state_ordering() {
        assert!(ConnectionState::Pending < ConnectionState::Handshaking);
        assert!(ConnectionState::Handshaking < ConnectionState::Connected);
        assert!(ConnectionState::Connected < ConnectionState::Closing);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
    }

    #[test]
    fn test_connection_state_predicates() {
        assert!(ConnectionState::Pending.is_pre_handover());
        assert!(ConnectionState::Handshaking.is_pre_handover());
        assert!(!ConnectionState::Connected.is_pre_handover());

        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Closing.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }
}
