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

//! Server and per-listener configuration types
//!
//! [`ServerOptions`] holds the process-wide settings; each bound endpoint is
//! described by a [`HostOptions`] record. Loading these from a configuration
//! file is the caller's concern; the framework only consumes the records.
//!
//! # Example
//!
//! ```
//! use switchyard::{HostOptions, ServerOptions, TlsVersion};
//! use std::time::Duration;
//!
//! let options = ServerOptions::default()
//!     .with_host(HostOptions::new(4040))
//!     .with_request_timeout(Duration::from_secs(10))
//!     .with_ping_interval(Duration::from_secs(60))
//!     .with_no_delay(true);
//!
//! assert_eq!(options.hosts.len(), 1);
//! assert_eq!(options.hosts[0].security, TlsVersion::None);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// TLS protocol version selector for a listening endpoint
///
/// `None` disables TLS on the host even when a certificate is configured.
/// `Tls` negotiates any version the TLS backend supports. The legacy 1.0/1.1
/// selectors are accepted for compatibility and negotiate the backend
/// defaults, since rustls does not implement them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// No TLS; plain TCP
    #[default]
    None,
    /// Any supported TLS version
    Tls,
    /// TLS 1.1 (not supported by the backend; treated as `Tls`)
    Tls11,
    /// TLS 1.2 only
    Tls12,
    /// TLS 1.3 only
    Tls13,
}

impl TlsVersion {
    /// Check whether this selector enables TLS at all
    pub fn is_secure(self) -> bool {
        !matches!(self, TlsVersion::None)
    }
}

/// Certificate material for a TLS-enabled host
///
/// Both files are PEM-encoded; the key may be PKCS#8, PKCS#1 or SEC1.
#[derive(Debug, Clone)]
pub struct CertificateOptions {
    /// Path to the PEM certificate chain
    pub certificate: PathBuf,
    /// Path to the PEM private key
    pub private_key: PathBuf,
}

impl CertificateOptions {
    /// Create a new certificate record from a certificate and key path
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }
}

/// Per-listener bind record
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Address to bind
    pub address: IpAddr,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// TLS version selector
    pub security: TlsVersion,
    /// Certificate material, required when `security` is not `None`
    pub certificate: Option<CertificateOptions>,
}

impl HostOptions {
    /// Create a plain-TCP host on all interfaces
    pub fn new(port: u16) -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            security: TlsVersion::None,
            certificate: None,
        }
    }

    /// Set the bind address
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    /// Enable TLS with the given version selector and certificate
    pub fn with_tls(mut self, security: TlsVersion, certificate: CertificateOptions) -> Self {
        self.security = security;
        self.certificate = Some(certificate);
        self
    }

    /// Get the socket address this host binds
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Check whether this host terminates TLS
    ///
    /// TLS is active only when a version selector other than `None` is set
    /// and certificate material is present.
    pub fn is_secure(&self) -> bool {
        self.security.is_secure() && self.certificate.is_some()
    }
}

/// Process-wide server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Per-listener bind records
    pub hosts: Vec<HostOptions>,

    /// Handshake deadline for newly accepted connections
    ///
    /// A connection that has not been claimed by a protocol within this
    /// window is force-closed by the keep-alive reaper.
    pub request_timeout: Duration,

    /// Heartbeat cadence; zero disables the heartbeat manager
    pub ping_interval: Duration,

    /// Set TCP_NODELAY on each accepted socket
    pub no_delay: bool,

    /// Apply the platform low-latency ack hint on each accepted socket
    ///
    /// Honored on Linux (TCP_QUICKACK); a no-op elsewhere.
    pub quick_ack: bool,

    /// Listen backlog; 0 uses the system default
    pub max_pending_connections: u32,

    /// Accept any peer certificate during the TLS handshake
    pub bypass_tls_validation: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            request_timeout: Duration::from_secs(15),
            ping_interval: Duration::ZERO,
            no_delay: true,
            quick_ack: false,
            max_pending_connections: 0,
            bypass_tls_validation: false,
        }
    }
}

impl ServerOptions {
    /// Create options with a single plain-TCP host on the given port
    pub fn with_port(port: u16) -> Self {
        Self::default().with_host(HostOptions::new(port))
    }

    /// Append a host record
    pub fn with_host(mut self, host: HostOptions) -> Self {
        self.hosts.push(host);
        self
    }

    /// Set the handshake deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the heartbeat cadence; `Duration::ZERO` disables heartbeat
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted sockets
    pub fn with_no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Enable or disable the platform quick-ack hint
    pub fn with_quick_ack(mut self, enabled: bool) -> Self {
        self.quick_ack = enabled;
        self
    }

    /// Set the listen backlog; 0 uses the system default
    pub fn with_max_pending_connections(mut self, backlog: u32) -> Self {
        self.max_pending_connections = backlog;
        self
    }

    /// Accept any peer certificate during the TLS handshake
    pub fn with_bypass_tls_validation(mut self, enabled: bool) -> Self {
        self.bypass_tls_validation = enabled;
        self
    }

    /// Effective reaper tick interval: `min(1s, request_timeout / 4)`
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(1).min(self.request_timeout / 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert!(options.hosts.is_empty());
        assert_eq!(options.request_timeout, Duration::from_secs(15));
        assert_eq!(options.ping_interval, Duration::ZERO);
        assert!(options.no_delay);
        assert!(!options.quick_ack);
        assert_eq!(options.max_pending_connections, 0);
    }

    #[test]
    fn test_builder_chain() {
        let options = ServerOptions::with_port(4040)
            .with_request_timeout(Duration::from_secs(5))
            .with_ping_interval(Duration::from_secs(30))
            .with_quick_ack(true)
            .with_max_pending_connections(128);

        assert_eq!(options.hosts.len(), 1);
        assert_eq!(options.hosts[0].port, 4040);
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.ping_interval, Duration::from_secs(30));
        assert!(options.quick_ack);
        assert_eq!(options.max_pending_connections, 128);
    }

    #[test]
    fn test_host_security() {
        let plain = HostOptions::new(4040);
        assert!(!plain.is_secure());

        // A version selector without certificate material stays plain.
        let mut half = HostOptions::new(4041);
        half.security = TlsVersion::Tls12;
        assert!(!half.is_secure());

        let secure = HostOptions::new(4042).with_tls(
            TlsVersion::Tls13,
            CertificateOptions::new("server.pem", "server.key"),
        );
        assert!(secure.is_secure());
    }

    #[test]
    fn test_reaper_interval() {
        let fast = ServerOptions::default().with_request_timeout(Duration::from_secs(2));
        assert_eq!(fast.reaper_interval(), Duration::from_millis(500));

        let slow = ServerOptions::default().with_request_timeout(Duration::from_secs(60));
        assert_eq!(slow.reaper_interval(), Duration::from_secs(1));
    }
}
