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

//! Accept pipeline: accept → TLS → peek → handshake → dispatch
//!
//! Runs once per accepted socket, on its own task. The pipeline configures
//! the transport, creates the connection under the listener's keep-alive
//! scope, performs the optional TLS wrap, peeks the first bytes, offers
//! them to the registered protocols in priority order, and hands the
//! connection to the first protocol that accepts. Reply bytes, if any, are
//! written before the protocol's handler runs, and the peeked bytes reach
//! the handler exactly once as replay input.
//!
//! Failures here are isolated: the connection is closed idempotently, the
//! error surfaces through the server's inner-error subscribers, and the
//! accept loop never notices.

use crate::server::Server;
use crate::{
    Connection, ConnectionState, Handover, HandshakeResult, HostListener, Result, ServerError,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace};

/// Number of bytes peeked for protocol discovery
pub const PEEK_SIZE: usize = 8;

/// Why a connection ended without a protocol handler running
///
/// These are normal outcomes, closed quietly; only genuine errors surface
/// through the inner-error channel.
enum Unclaimed {
    /// The peer closed before sending anything
    PeerClosed,
    /// No registered protocol accepted the peeked bytes
    NoProtocolAccepted,
    /// The connection was force-closed (deadline or shutdown) mid-pipeline
    ClosedDuringHandshake,
    /// The handshake reply could not be written
    ReplyWriteFailed,
}

enum Outcome {
    /// A protocol's handler ran to completion
    Handled,
    /// The connection was closed without a handler
    Unclaimed(Unclaimed),
}

/// Run the pipeline for one accepted socket
#[instrument(skip(server, listener, stream), fields(peer = %peer_addr))]
pub(crate) async fn run(
    server: Arc<Server>,
    listener: Arc<HostListener>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    // A listener stopped between accept and dispatch drops the attempt.
    if listener.is_stopped() {
        trace!("listener stopped, dropping accepted socket");
        return;
    }

    configure_stream(&stream, &server);

    let connection = Connection::new(
        server.next_connection_id(),
        peer_addr,
        listener.is_secure(),
        Arc::downgrade(&listener),
        server.options().request_timeout,
    );
    listener.scope().insert(connection.clone());
    server.metrics().connection_opened();
    server.track_connection(&connection);

    match establish(&server, &listener, &connection, stream).await {
        Ok(Outcome::Handled) => {
            trace!(connection_id = %connection.id(), "protocol handler returned");
        }
        Ok(Outcome::Unclaimed(reason)) => {
            server.metrics().handshake_rejected();
            let reason = match reason {
                Unclaimed::PeerClosed => "peer closed during peek",
                Unclaimed::NoProtocolAccepted => "no protocol accepted",
                Unclaimed::ClosedDuringHandshake => "closed before handover",
                Unclaimed::ReplyWriteFailed => "handshake reply write failed",
            };
            debug!(connection_id = %connection.id(), reason, "connection not handed over");
        }
        Err(error) => {
            server.metrics().connection_error();
            debug!(connection_id = %connection.id(), error = %error, "pipeline error");
            server.report_inner_error(error).await;
        }
    }

    // End of life for every path: idempotent teardown and deregistration.
    connection.disconnect().await;
    listener.scope().remove(connection.id());
    server.heartbeat_scope().remove(connection.id());
    server.untrack_connection(connection.id());
    server.metrics().connection_closed();
}

/// Steps 3–6: TLS wrap, peek, protocol discovery, dispatch
#[instrument(
    skip(server, listener, connection, stream),
    fields(connection_id = %connection.id())
)]
async fn establish(
    server: &Arc<Server>,
    listener: &Arc<HostListener>,
    connection: &Arc<Connection>,
    stream: TcpStream,
) -> Result<Outcome> {
    // TLS wrap under the host's certificate. The race against `closed()`
    // lets the reaper's deadline interrupt a stalled handshake.
    if let Some(acceptor) = listener.tls_acceptor() {
        let accept = acceptor.accept(stream);
        let tls_stream = tokio::select! {
            result = accept => result.map_err(|e| {
                ServerError::Tls(format!("handshake with {}: {e}", connection.peer_addr()))
            })?,
            _ = connection.closed() => {
                return Ok(Outcome::Unclaimed(Unclaimed::ClosedDuringHandshake));
            }
        };
        trace!("TLS handshake complete");
        connection.install_transport(tls_stream).await;
    } else {
        connection.install_transport(stream).await;
    }

    // Peek: one read of up to PEEK_SIZE bytes. They are consumed from the
    // transport here and replayed to the winning protocol; the transport
    // never produces them again.
    let mut peek_buf = [0u8; PEEK_SIZE];
    let peeked = match connection.read_some(&mut peek_buf).await {
        Ok(0) => return Ok(Outcome::Unclaimed(Unclaimed::PeerClosed)),
        Ok(n) => Bytes::copy_from_slice(&peek_buf[..n]),
        Err(_) if connection.is_closed() => {
            return Ok(Outcome::Unclaimed(Unclaimed::ClosedDuringHandshake));
        }
        Err(e) => return Err(ServerError::Io(e)),
    };

    connection.advance_state(ConnectionState::Handshaking);

    let protocols = server.registry().snapshot();
    for protocol in protocols.iter() {
        if connection.is_closed() {
            return Ok(Outcome::Unclaimed(Unclaimed::ClosedDuringHandshake));
        }

        match protocol.attempt_handshake(connection, &peeked).await {
            HandshakeResult::Rejected => continue,
            HandshakeResult::Accepted { reply, socket } => {
                debug!(protocol = protocol.name(), "handshake accepted");

                // Installing the protocol and advancing to Connected happen
                // back to back: an installed protocol is only ever observed
                // on a Connected (or closing) connection.
                connection.set_protocol(protocol.clone());
                connection.advance_state(ConnectionState::Connected);
                listener.scope().remove(connection.id());

                if let Some(socket) = socket {
                    connection.set_socket(socket.clone());
                    socket.on_connected().await;
                }

                if let Some(reply) = reply {
                    if !connection.send(&reply).await {
                        return Ok(Outcome::Unclaimed(Unclaimed::ReplyWriteFailed));
                    }
                }

                server.metrics().handshake_accepted();
                if protocol.wants_heartbeat() {
                    server.heartbeat_scope().insert(connection.clone());
                }

                protocol
                    .handle_connection(connection.clone(), Handover::new(peeked))
                    .await;
                return Ok(Outcome::Handled);
            }
        }
    }

    Ok(Outcome::Unclaimed(Unclaimed::NoProtocolAccepted))
}

/// Step 1: per-socket transport options
fn configure_stream(stream: &TcpStream, server: &Arc<Server>) {
    let options = server.options();
    if options.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
    }

    #[cfg(target_os = "linux")]
    if options.quick_ack {
        let socket = socket2::SockRef::from(stream);
        if let Err(e) = socket.set_quickack(true) {
            debug!(error = %e, "failed to set TCP_QUICKACK");
        }
    }
}
