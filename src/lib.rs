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

//! Switchyard - Multi-protocol TCP server framework
//!
//! A host that binds one or more listening endpoints, accepts incoming
//! connections (optionally wrapping them in TLS), discovers the application
//! protocol by peeking the first bytes of the stream, and hands each
//! connection to the matching protocol handler. The framework is the
//! plumbing that lets several application protocols share one accept loop,
//! one TLS layer, one connection registry and one keep-alive reaper; it
//! does not parse application messages itself.
//!
//! # Overview
//!
//! - [`Server`] is the composition root: it owns the [`ProtocolRegistry`],
//!   builds a [`HostListener`] per configured host, and runs the liveness
//!   schedulers.
//! - [`Protocol`] is the plug-in point. The accept pipeline peeks up to the
//!   first 8 bytes of every new connection and offers them to the
//!   registered protocols in order; the first acceptance wins and the bytes
//!   are replayed to the winner exactly once.
//! - [`Connection`] owns the transport. Writes are strictly serialized per
//!   connection; disconnect is idempotent and the disconnected notification
//!   fires exactly once.
//! - Connections that never complete a handshake are force-closed by a
//!   per-listener reaper; connected sockets may opt into a process-wide
//!   ping/pong heartbeat.
//!
//! # Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use switchyard::{
//!     Connection, Handover, HandshakeResult, Protocol, Server, ServerOptions,
//! };
//!
//! struct EchoProtocol;
//!
//! #[async_trait]
//! impl Protocol for EchoProtocol {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn attempt_handshake(
//!         &self,
//!         _connection: &Arc<Connection>,
//!         peeked: &[u8],
//!     ) -> HandshakeResult {
//!         if peeked.first() == Some(&b'E') {
//!             HandshakeResult::accepted().with_reply(Bytes::from_static(b"OK\n"))
//!         } else {
//!             HandshakeResult::Rejected
//!         }
//!     }
//!
//!     async fn handle_connection(&self, connection: Arc<Connection>, handover: Handover) {
//!         // Replay the peeked bytes, then echo everything else.
//!         let _ = connection.send(&handover.previously_read[1..]).await;
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n) = connection.read_some(&mut buf).await {
//!             if n == 0 || !connection.send(&buf[..n]).await {
//!                 break;
//!             }
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> switchyard::Result<()> {
//!     let server = Server::new(ServerOptions::with_port(4040));
//!     server.use_protocol(Arc::new(EchoProtocol));
//!     server.run().await
//! }
//! ```

mod config;
mod connection;
mod error;
mod heartbeat;
mod keepalive;
mod listener;
mod metrics;
mod pipeline;
mod protocol;
mod registry;
mod server;
mod tls;
mod types;

pub use config::{CertificateOptions, HostOptions, ServerOptions, TlsVersion};
pub use connection::Connection;
pub use error::{Result, ServerError};
pub use heartbeat::HeartbeatScope;
pub use keepalive::KeepAliveScope;
pub use listener::HostListener;
pub use metrics::ServerMetrics;
pub use pipeline::PEEK_SIZE;
pub use protocol::{Handover, HandshakeResult, Protocol, ProtocolSocket, SwitchData};
pub use registry::ProtocolRegistry;
pub use server::{Server, ServerEvents};
pub use types::{ConnectionId, ConnectionInfo, ConnectionState, ServerSnapshot};
