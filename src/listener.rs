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

//! Host listener: one bound endpoint and its accept loop
//!
//! A listener owns the OS socket, the optional TLS acceptor for its
//! certificate, its keep-alive scope and reaper, and the accept-loop task.
//! Listeners are created at server start and destroyed at server stop;
//! a listener is never reused across restarts.

use crate::keepalive::{KeepAliveScope, Reaper};
use crate::pipeline;
use crate::server::Server;
use crate::{HostOptions, Result, ServerError};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Fallback listen backlog when the options leave it at the system default
const DEFAULT_BACKLOG: i32 = 1024;

/// One bound endpoint: socket, optional certificate, keep-alive scope
pub struct HostListener {
    /// Actual bound address (resolves port 0 to the ephemeral port)
    local_addr: SocketAddr,
    /// The bind record this listener was built from
    options: HostOptions,
    /// TLS acceptor, present when the host is secure
    tls: Option<tokio_rustls::TlsAcceptor>,
    /// Connections awaiting protocol handover
    scope: Arc<KeepAliveScope>,
    /// Cancelled on stop; interrupts the accept loop
    shutdown: CancellationToken,
    /// Handshake-deadline reaper
    reaper: StdMutex<Option<Reaper>>,
    /// Accept loop task
    accept_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl HostListener {
    /// Bind the endpoint and start accepting
    ///
    /// A bind or certificate failure is fatal to this listener only; the
    /// caller decides whether to continue with its other listeners.
    #[instrument(skip(server, options), fields(addr = %options.socket_addr()))]
    pub(crate) async fn start(server: &Arc<Server>, options: HostOptions) -> Result<Arc<Self>> {
        let requested = options.socket_addr();
        let server_options = server.options();

        let tls = match (options.is_secure(), options.certificate.as_ref()) {
            (true, Some(certificate)) => Some(crate::tls::build_acceptor(
                certificate,
                options.security,
                server_options.bypass_tls_validation,
            )?),
            _ => None,
        };

        let listener = bind_listener(requested, server_options.max_pending_connections)
            .map_err(|source| ServerError::BindFailed {
                addr: requested,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            secure = tls.is_some(),
            "listener bound"
        );

        let scope = Arc::new(KeepAliveScope::new());
        let host = Arc::new(Self {
            local_addr,
            options,
            tls,
            scope: scope.clone(),
            shutdown: CancellationToken::new(),
            reaper: StdMutex::new(None),
            accept_handle: StdMutex::new(None),
        });

        let reaper = Reaper::spawn(
            scope,
            server_options.reaper_interval(),
            server.metrics_handle(),
        );
        *host.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        let handle = tokio::spawn(accept_loop(listener, server.clone(), host.clone()));
        *host
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(host)
    }

    /// Stop accepting: interrupt the accept loop, stop the reaper, release
    /// the certificate with the listener
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }

        info!("listener stopped");
    }

    /// The address this listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether accepted connections are TLS-wrapped
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether the listener has been stopped
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The bind record this listener was built from
    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// The listener's keep-alive scope
    pub(crate) fn scope(&self) -> &Arc<KeepAliveScope> {
        &self.scope
    }

    /// The listener's TLS acceptor, when secure
    pub(crate) fn tls_acceptor(&self) -> Option<&tokio_rustls::TlsAcceptor> {
        self.tls.as_ref()
    }
}

impl std::fmt::Debug for HostListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostListener")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.is_secure())
            .field("stopped", &self.is_stopped())
            .field("pending", &self.scope.len())
            .finish()
    }
}

/// Bind a TCP listener honoring the configured backlog
fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    let backlog = if backlog == 0 {
        DEFAULT_BACKLOG
    } else {
        i32::try_from(backlog).unwrap_or(i32::MAX)
    };
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections until the listener is stopped
///
/// Every accepted socket gets its own pipeline task so a slow TLS handshake
/// or peek never blocks the loop; the loop's latency is bounded by `accept`
/// itself. Accept errors are reported and the loop backs off briefly to
/// avoid spinning.
async fn accept_loop(listener: TcpListener, server: Arc<Server>, host: Arc<HostListener>) {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = host.shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(peer = %peer_addr, listener = %host.local_addr, "accepted connection");
                let server = server.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    pipeline::run(server, host, stream, peer_addr).await;
                });
            }
            Err(e) => {
                warn!(listener = %host.local_addr, error = %e, "accept failed");
                server.metrics().accept_error();
                server.report_inner_error(ServerError::Io(e)).await;

                // Back off on errors to avoid a tight loop.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = host.shutdown.cancelled() => break,
                }
            }
        }
    }

    info!(addr = %host.local_addr, "accept loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_listener(addr, 0).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_with_backlog() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_listener(addr, 16).unwrap();
        assert!(listener.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind_listener(addr, 0).unwrap();
        let taken = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two live listeners on one port.
        let result = bind_listener(taken, 0);
        assert!(result.is_err());
    }
}
