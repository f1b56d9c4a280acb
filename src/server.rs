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

//! Server facade
//!
//! The [`Server`] is the composition root: it owns the protocol registry,
//! builds one [`HostListener`](crate::HostListener) per configured host at
//! start, runs the optional heartbeat manager, and exposes the
//! protocol-switch operation. Stopping halts accepts and the liveness
//! schedulers but leaves already-connected clients to their protocols;
//! callers wanting a hard shutdown iterate [`Server::connections`]
//! themselves.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard::{Server, ServerOptions};
//!
//! # struct EchoProtocol;
//! # use async_trait::async_trait;
//! # #[async_trait]
//! # impl switchyard::Protocol for EchoProtocol {
//! #     fn name(&self) -> &str { "echo" }
//! #     async fn attempt_handshake(
//! #         &self,
//! #         _c: &Arc<switchyard::Connection>,
//! #         _p: &[u8],
//! #     ) -> switchyard::HandshakeResult { switchyard::HandshakeResult::accepted() }
//! #     async fn handle_connection(
//! #         &self,
//! #         _c: Arc<switchyard::Connection>,
//! #         _h: switchyard::Handover,
//! #     ) {}
//! # }
//! # async fn example() -> switchyard::Result<()> {
//! let server = Server::new(ServerOptions::with_port(4040));
//! server.use_protocol(Arc::new(EchoProtocol));
//! server.start().await?;
//! // ... accept and serve until:
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::heartbeat::{HeartbeatManager, HeartbeatScope};
use crate::metrics::ServerMetrics;
use crate::{
    Connection, ConnectionId, Handover, HandshakeResult, HostListener, HostOptions, Protocol,
    ProtocolRegistry, Result, ServerError, ServerOptions, ServerSnapshot, SwitchData,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Server lifecycle and error notifications
///
/// All methods default to no-ops. Subscribers must be registered before
/// `start`; registration is not synchronized against a running server.
#[async_trait]
pub trait ServerEvents: Send + Sync + 'static {
    /// The server started and all surviving listeners are accepting
    async fn on_started(&self, server: &Server) {
        let _ = server;
    }

    /// The server stopped; fired exactly once per successful stop
    async fn on_stopped(&self, server: &Server) {
        let _ = server;
    }

    /// An error was isolated to a single connection or accept attempt
    async fn on_inner_error(&self, server: &Server, error: &ServerError) {
        let _ = (server, error);
    }
}

/// Multi-protocol server host
pub struct Server {
    /// Process-wide options
    options: ServerOptions,
    /// Bind records consumed at start; `run_on` may append
    hosts: StdMutex<Vec<HostOptions>>,
    /// Ordered protocol registry
    registry: ProtocolRegistry,
    /// Lock-free counters
    metrics: Arc<ServerMetrics>,
    /// Heartbeat participants (process-wide, opt-in)
    heartbeat_scope: Arc<HeartbeatScope>,
    /// Live connections, tracked for the server's lifetime
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Listeners of the current run
    listeners: StdMutex<Vec<Arc<HostListener>>>,
    /// Heartbeat manager of the current run
    heartbeat: StdMutex<Option<HeartbeatManager>>,
    /// Event subscribers, registered before start
    subscribers: StdMutex<Vec<Arc<dyn ServerEvents>>>,
    /// Running flag; `start` is rejected while set
    running: AtomicBool,
    /// Cancelled when the current run stops; `run` waits on it
    run_token: StdMutex<CancellationToken>,
    /// Connection identity source; never reused
    next_connection_id: AtomicU64,
    /// When the server object was created
    created_at: Instant,
    /// Back-reference handed to listeners and pipelines
    self_ref: Weak<Server>,
}

impl Server {
    /// Create a new server from the given options
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let hosts = options.hosts.clone();
        Arc::new_cyclic(|self_ref| Self {
            options,
            hosts: StdMutex::new(hosts),
            registry: ProtocolRegistry::new(),
            metrics: Arc::new(ServerMetrics::new()),
            heartbeat_scope: Arc::new(HeartbeatScope::new()),
            connections: DashMap::new(),
            listeners: StdMutex::new(Vec::new()),
            heartbeat: StdMutex::new(None),
            subscribers: StdMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            run_token: StdMutex::new(CancellationToken::new()),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            self_ref: self_ref.clone(),
        })
    }

    /// Register a protocol; replaces an existing protocol of the same name
    pub fn use_protocol(&self, protocol: Arc<dyn Protocol>) {
        info!(protocol = protocol.name(), "protocol registered");
        self.registry.add(protocol);
    }

    /// Register an event subscriber; call before `start`
    pub fn subscribe(&self, events: Arc<dyn ServerEvents>) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events);
    }

    /// Start all configured listeners
    ///
    /// Rejected when already running or when no hosts are configured. A
    /// host that fails to bind is reported and skipped; `start` fails only
    /// when every host fails.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let this = self.strong_handle();
        let hosts: Vec<HostOptions> = self
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if hosts.is_empty() {
            return Err(ServerError::NoHostsConfigured);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        *self
            .run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();

        let mut started = Vec::new();
        let mut first_failure = None;
        for host in hosts {
            let addr = host.socket_addr();
            match HostListener::start(&this, host).await {
                Ok(listener) => started.push(listener),
                Err(e) => {
                    error!(addr = %addr, error = %e, "listener failed to start");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }

        if started.is_empty() {
            self.running.store(false, Ordering::SeqCst);
            return Err(first_failure.unwrap_or(ServerError::NoHostsConfigured));
        }

        *self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = started;

        if !self.options.ping_interval.is_zero() {
            let manager = HeartbeatManager::spawn(
                self.heartbeat_scope.clone(),
                self.options.ping_interval,
                self.metrics.clone(),
            );
            *self
                .heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(manager);
        }

        info!(listeners = self.listener_addrs().len(), "server started");
        self.fire_started().await;
        Ok(())
    }

    /// Stop accepting and halt the liveness schedulers
    ///
    /// Already-connected clients are not disconnected; their handlers run
    /// to completion. The stopped event fires exactly once per run.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }

        info!("stopping server");

        let listeners = std::mem::take(
            &mut *self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for listener in listeners {
            listener.stop().await;
        }

        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        self.run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();

        self.fire_stopped().await;
        info!("server stopped");
        Ok(())
    }

    /// Start and block until `stop` is called from elsewhere
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let token = self
            .run_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        token.cancelled().await;
        Ok(())
    }

    /// Add a plain host on the given port, then start and block
    pub async fn run_on(&self, port: u16) -> Result<()> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HostOptions::new(port));
        self.run().await
    }

    /// Re-handshake a connection under the named protocol
    ///
    /// The target protocol's `switch_to` decides with application-supplied
    /// data instead of wire bytes. On rejection the connection is closed.
    /// On acceptance the installed protocol is replaced, the optional reply
    /// is written, the socket's protocol-switched hook fires once, and the
    /// new protocol's handler runs until it returns.
    #[instrument(skip(self, connection, data), fields(connection_id = %connection.id()))]
    pub async fn switch_protocol(
        &self,
        connection: &Arc<Connection>,
        name: &str,
        data: SwitchData,
    ) -> Result<()> {
        let Some(protocol) = self.registry.find(name) else {
            return Err(ServerError::ProtocolNotFound(name.to_string()));
        };
        let previous = connection.protocol_name().unwrap_or_default();

        match protocol.switch_to(connection, data).await {
            HandshakeResult::Rejected => {
                debug!(protocol = protocol.name(), "protocol switch rejected, closing");
                connection.disconnect().await;
                Err(ServerError::ConnectionClosed)
            }
            HandshakeResult::Accepted { reply, socket } => {
                connection.set_protocol(protocol.clone());
                if let Some(socket) = socket {
                    connection.set_socket(socket);
                }

                if let Some(reply) = reply {
                    if !connection.send(&reply).await {
                        return Err(ServerError::ConnectionClosed);
                    }
                }

                if protocol.wants_heartbeat() {
                    self.heartbeat_scope.insert(connection.clone());
                } else {
                    self.heartbeat_scope.remove(connection.id());
                }

                info!(from = %previous, to = protocol.name(), "protocol switched");
                if let Some(socket) = connection.socket() {
                    socket.on_protocol_switched(&previous, protocol.name()).await;
                }

                protocol
                    .handle_connection(connection.clone(), Handover::default())
                    .await;
                Ok(())
            }
        }
    }

    /// Check whether the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The process-wide options
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// The protocol registry
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// The server metrics
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Addresses the current run's listeners are bound to
    pub fn listener_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|l| l.local_addr())
            .collect()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of all live connections
    ///
    /// Useful for hard shutdown: stop the server, then disconnect each.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get a snapshot of the server state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.connections.len(),
            total_connections: self.metrics.total_connections(),
            listeners: self.listener_addrs(),
            uptime: self.created_at.elapsed(),
        }
    }

    /// A strong handle for listeners and pipelines
    ///
    /// `new` is the only constructor and builds through `Arc::new_cyclic`,
    /// so a live `&self` always has a live `Arc` behind it.
    fn strong_handle(&self) -> Arc<Server> {
        self.self_ref
            .upgrade()
            .expect("server constructed through Arc::new_cyclic")
    }

    pub(crate) fn metrics_handle(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub(crate) fn heartbeat_scope(&self) -> &Arc<HeartbeatScope> {
        &self.heartbeat_scope
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn track_connection(&self, connection: &Arc<Connection>) {
        self.connections.insert(connection.id(), connection.clone());
    }

    pub(crate) fn untrack_connection(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Surface a per-connection error to the inner-error subscribers
    ///
    /// Swallowed when nobody subscribed.
    pub(crate) async fn report_inner_error(&self, error: ServerError) {
        warn!(error = %error, "inner error");
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_inner_error(self, &error).await;
        }
    }

    async fn fire_started(&self) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_started(self).await;
        }
    }

    async fn fire_stopped(&self) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_stopped(self).await;
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .field("protocols", &self.registry.len())
            .field("connections", &self.connection_count())
            .field("listeners", &self.listener_addrs())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("server dropped while still running");
            self.running.store(false, Ordering::SeqCst);
            self.run_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HandshakeResult;

    struct AcceptAll;

    #[async_trait]
    impl Protocol for AcceptAll {
        fn name(&self) -> &str {
            "accept-all"
        }

        async fn attempt_handshake(
            &self,
            _connection: &Arc<Connection>,
            _peeked: &[u8],
        ) -> HandshakeResult {
            HandshakeResult::accepted()
        }

        async fn handle_connection(&self, _connection: Arc<Connection>, _handover: Handover) {}
    }

    #[tokio::test]
    async fn test_start_without_hosts_fails() {
        let server = Server::new(ServerOptions::default());
        let result = server.start().await;
        assert!(matches!(result, Err(ServerError::NoHostsConfigured)));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = Server::new(
            ServerOptions::with_port(0).with_host(HostOptions::new(0).with_address(
                "127.0.0.1".parse().unwrap(),
            )),
        );
        server.use_protocol(Arc::new(AcceptAll));

        assert!(!server.is_running());
        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(!server.listener_addrs().is_empty());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.listener_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let server = Server::new(ServerOptions::with_port(0));
        server.start().await.unwrap();

        let result = server.start().await;
        assert!(matches!(result, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let server = Server::new(ServerOptions::with_port(0));
        let result = server.stop().await;
        assert!(matches!(result, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_snapshot_when_idle() {
        let server = Server::new(ServerOptions::default());
        let snapshot = server.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_connections, 0);
        assert!(snapshot.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_use_protocol_replaces_by_name() {
        let server = Server::new(ServerOptions::default());
        server.use_protocol(Arc::new(AcceptAll));
        server.use_protocol(Arc::new(AcceptAll));
        assert_eq!(server.registry().len(), 1);
        assert!(server.registry().find("ACCEPT-ALL").is_some());
    }
}
