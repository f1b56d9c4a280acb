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

//! Protocol and protocol-socket traits
//!
//! An application protocol plugs into the server by implementing
//! [`Protocol`]. The accept pipeline peeks the first bytes of every new
//! connection and offers them to each registered protocol in order; the
//! first one whose [`Protocol::attempt_handshake`] accepts takes ownership
//! of the connection and its [`Protocol::handle_connection`] runs for the
//! connection's lifetime.
//!
//! A protocol may expose its own connection view by returning a
//! [`ProtocolSocket`] from the handshake; the server uses it to deliver
//! lifecycle notifications and heartbeat pings.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use switchyard::{Connection, Handover, HandshakeResult, Protocol};
//!
//! struct LinefeedProtocol;
//!
//! #[async_trait]
//! impl Protocol for LinefeedProtocol {
//!     fn name(&self) -> &str {
//!         "linefeed"
//!     }
//!
//!     async fn attempt_handshake(
//!         &self,
//!         _connection: &Arc<Connection>,
//!         peeked: &[u8],
//!     ) -> HandshakeResult {
//!         if peeked.first() == Some(&b'L') {
//!             HandshakeResult::accepted().with_reply(Bytes::from_static(b"OK\n"))
//!         } else {
//!             HandshakeResult::Rejected
//!         }
//!     }
//!
//!     async fn handle_connection(&self, connection: Arc<Connection>, handover: Handover) {
//!         let mut buf = [0u8; 1024];
//!         // handover.previously_read replays the peeked bytes first
//!         let _ = handover.previously_read;
//!         while let Ok(n) = connection.read_some(&mut buf).await {
//!             if n == 0 {
//!                 break;
//!             }
//!             if !connection.send(&buf[..n]).await {
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

use crate::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;

/// Application-supplied data handed to [`Protocol::switch_to`]
///
/// Opaque to the server; the target protocol downcasts it to whatever it
/// expects.
pub type SwitchData = Box<dyn Any + Send + Sync>;

/// Outcome of a protocol handshake attempt
#[derive(Default)]
pub enum HandshakeResult {
    /// The protocol claims the connection
    Accepted {
        /// Bytes written back to the peer before the handler runs
        reply: Option<Bytes>,
        /// Protocol-specific view of the connection
        socket: Option<Arc<dyn ProtocolSocket>>,
    },
    /// The protocol does not recognize the connection
    #[default]
    Rejected,
}

impl HandshakeResult {
    /// Accept the connection with no reply and no socket
    pub fn accepted() -> Self {
        Self::Accepted {
            reply: None,
            socket: None,
        }
    }

    /// Attach reply bytes to an accepted result
    pub fn with_reply(self, reply: Bytes) -> Self {
        match self {
            Self::Accepted { socket, .. } => Self::Accepted {
                reply: Some(reply),
                socket,
            },
            Self::Rejected => Self::Rejected,
        }
    }

    /// Attach a protocol socket to an accepted result
    pub fn with_socket(self, socket: Arc<dyn ProtocolSocket>) -> Self {
        match self {
            Self::Accepted { reply, .. } => Self::Accepted {
                reply,
                socket: Some(socket),
            },
            Self::Rejected => Self::Rejected,
        }
    }

    /// Check whether the protocol accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

impl std::fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted { reply, socket } => f
                .debug_struct("Accepted")
                .field("reply_len", &reply.as_ref().map(Bytes::len))
                .field("has_socket", &socket.is_some())
                .finish(),
            Self::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Everything a winning protocol receives along with the connection
#[derive(Debug, Default)]
pub struct Handover {
    /// The bytes peeked during protocol discovery
    ///
    /// They were consumed from the transport exactly once and must be
    /// parsed before any further read; the transport will not produce them
    /// again. Empty after a protocol switch.
    pub previously_read: Bytes,
}

impl Handover {
    /// Create a handover replaying the given bytes
    pub fn new(previously_read: Bytes) -> Self {
        Self { previously_read }
    }
}

/// A pluggable application protocol
///
/// Protocols are shared immutable objects: registered once, referenced by
/// every connection they accept. Removal from the registry does not affect
/// connections already handed over.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Registry identity; matched case-insensitively
    fn name(&self) -> &str;

    /// Whether connections of this protocol participate in heartbeat
    fn wants_heartbeat(&self) -> bool {
        false
    }

    /// Inspect the first peeked bytes and decide whether to claim the
    /// connection
    ///
    /// `peeked` holds at most the first 8 bytes from the stream and may be
    /// shorter. Implementations must not read from the connection here.
    async fn attempt_handshake(
        &self,
        connection: &Arc<Connection>,
        peeked: &[u8],
    ) -> HandshakeResult;

    /// Re-handshake an already-connected connection using
    /// application-supplied data instead of wire bytes
    ///
    /// The default implementation rejects; protocols that support being
    /// switched to override it.
    async fn switch_to(&self, connection: &Arc<Connection>, data: SwitchData) -> HandshakeResult {
        let _ = (connection, data);
        HandshakeResult::Rejected
    }

    /// Per-connection service loop; runs for the life of the connection
    async fn handle_connection(&self, connection: Arc<Connection>, handover: Handover);
}

/// Protocol-specific view of a connection
///
/// Returned by a handshake and installed on the [`Connection`]; the server
/// delivers lifecycle notifications and heartbeat pings through it.
#[async_trait]
pub trait ProtocolSocket: Send + Sync + 'static {
    /// Send a protocol-level ping; returns false when the write failed
    async fn ping(&self) -> bool;

    /// Send a protocol-level pong, echoing an optional payload
    async fn pong(&self, payload: Option<Bytes>) -> bool;

    /// The connection completed its handshake under this socket's protocol
    async fn on_connected(&self) {}

    /// The connection is gone; fired exactly once
    async fn on_disconnected(&self) {}

    /// The installed protocol changed via a protocol switch
    async fn on_protocol_switched(&self, previous: &str, current: &str) {
        let _ = (previous, current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_result_builders() {
        let accepted = HandshakeResult::accepted();
        assert!(accepted.is_accepted());

        let with_reply = HandshakeResult::accepted().with_reply(Bytes::from_static(b"hi"));
        match with_reply {
            HandshakeResult::Accepted { reply, socket } => {
                assert_eq!(reply.unwrap(), Bytes::from_static(b"hi"));
                assert!(socket.is_none());
            }
            HandshakeResult::Rejected => panic!("expected accepted"),
        }

        assert!(!HandshakeResult::Rejected.is_accepted());
        // Builders on a rejected result stay rejected.
        assert!(!HandshakeResult::Rejected
            .with_reply(Bytes::from_static(b"hi"))
            .is_accepted());
    }

    #[test]
    fn test_handover_replay_bytes() {
        let handover = Handover::new(Bytes::from_static(b"GET /"));
        assert_eq!(&handover.previously_read[..], b"GET /");

        let empty = Handover::default();
        assert!(empty.previously_read.is_empty());
    }
}
