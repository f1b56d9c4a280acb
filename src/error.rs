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

//! Error types for the server framework

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types
///
/// Handshake rejection (no protocol accepted, or the peer closed before
/// sending anything) is a normal outcome and is not represented here; only
/// genuine failures are.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error from the underlying TCP stream or listener
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind a listening endpoint
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// The address that could not be bound
        addr: SocketAddr,
        /// The underlying bind error
        source: std::io::Error,
    },

    /// Certificate or private key could not be loaded
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS acceptor construction or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// An unexpected error occurred while handshaking a connection
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection has been closed
    #[error("connection closed")]
    ConnectionClosed,

    /// No protocol with the given name is registered
    #[error("protocol {0:?} not found")]
    ProtocolNotFound(String),

    /// The server was started without any configured hosts
    #[error("no hosts configured")]
    NoHostsConfigured,

    /// The server is already running
    #[error("server already running")]
    AlreadyRunning,

    /// The server is not running
    #[error("server not running")]
    NotRunning,
}

impl ServerError {
    /// Check if the error is recoverable
    ///
    /// Recoverable errors are isolated to a single connection or accept
    /// attempt; the server keeps running after reporting them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::Tls(_)
                | ServerError::HandshakeFailed(_)
                | ServerError::ConnectionClosed
        )
    }

    /// Check if the error is a configuration error
    ///
    /// Configuration errors are raised synchronously from `start` and never
    /// from a running server.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ServerError::NoHostsConfigured | ServerError::AlreadyRunning | ServerError::NotRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(ServerError::ConnectionClosed.is_recoverable());
        assert!(ServerError::Tls("bad record".into()).is_recoverable());
        assert!(!ServerError::AlreadyRunning.is_recoverable());
        assert!(!ServerError::NoHostsConfigured.is_recoverable());
    }

    #[test]
    fn test_error_is_configuration() {
        assert!(ServerError::NoHostsConfigured.is_configuration());
        assert!(ServerError::AlreadyRunning.is_configuration());
        assert!(!ServerError::ConnectionClosed.is_configuration());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::ProtocolNotFound("WebSocket".to_string());
        assert_eq!(err.to_string(), "protocol \"WebSocket\" not found");

        let err = ServerError::NoHostsConfigured;
        assert_eq!(err.to_string(), "no hosts configured");
    }
}
