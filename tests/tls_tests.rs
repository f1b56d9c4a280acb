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

//! TLS integration tests: secure hosts, handshake failures

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard::{
    CertificateOptions, Connection, Handover, HandshakeResult, HostOptions, Protocol, Server,
    ServerError, ServerEvents, ServerOptions, TlsVersion,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Self-signed certificate material written to disk for the server, with
/// the matching root kept in memory for the test client
struct TestCertificate {
    options: CertificateOptions,
    roots: RootCertStore,
}

fn generate_certificate(tag: &str) -> TestCertificate {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let dir = std::env::temp_dir().join(format!(
        "switchyard-tls-{}-{tag}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();

    TestCertificate {
        options: CertificateOptions::new(cert_path, key_path),
        roots,
    }
}

fn client_connector(roots: RootCertStore) -> TlsConnector {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(rustls::ALL_VERSIONS)
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Accepts any connection and echoes bytes, replaying the peeked head
struct EchoAnything;

#[async_trait]
impl Protocol for EchoAnything {
    fn name(&self) -> &str {
        "echo-anything"
    }

    async fn attempt_handshake(
        &self,
        _connection: &Arc<Connection>,
        _peeked: &[u8],
    ) -> HandshakeResult {
        HandshakeResult::accepted().with_reply(Bytes::from_static(b"HELLO\n"))
    }

    async fn handle_connection(&self, connection: Arc<Connection>, handover: Handover) {
        if !handover.previously_read.is_empty()
            && !connection.send(&handover.previously_read).await
        {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match connection.read_some(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if !connection.send(&buf[..n]).await {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct InnerErrorCounter {
    inner_errors: AtomicUsize,
}

#[async_trait]
impl ServerEvents for InnerErrorCounter {
    async fn on_inner_error(&self, _server: &Server, _error: &ServerError) {
        self.inner_errors.fetch_add(1, Ordering::SeqCst);
    }
}

async fn start_tls_server(
    certificate: &TestCertificate,
    version: TlsVersion,
) -> (Arc<Server>, SocketAddr, Arc<InnerErrorCounter>) {
    let host = HostOptions::new(0)
        .with_address("127.0.0.1".parse().unwrap())
        .with_tls(version, certificate.options.clone());

    let events = Arc::new(InnerErrorCounter::default());
    let server = Server::new(ServerOptions::default().with_host(host));
    server.subscribe(events.clone());
    server.use_protocol(Arc::new(EchoAnything));
    server.start().await.unwrap();
    let addr = server.listener_addrs()[0];
    (server, addr, events)
}

#[tokio::test]
async fn test_tls_echo_round_trip() {
    let certificate = generate_certificate("echo");
    let (server, addr, events) = start_tls_server(&certificate, TlsVersion::Tls).await;

    let connector = client_connector(certificate.roots);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"ping").await.unwrap();

    // Reply first, then the replayed peeked bytes.
    let mut response = [0u8; 10];
    timeout(Duration::from_secs(5), tls.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"HELLO\nping");

    tls.write_all(b"more").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), tls.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"more");

    assert_eq!(events.inner_errors.load(Ordering::SeqCst), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tls13_pinned_version() {
    let certificate = generate_certificate("tls13");
    let (server, addr, _events) = start_tls_server(&certificate, TlsVersion::Tls13).await;

    let connector = client_connector(certificate.roots);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"x").await.unwrap();
    let mut reply = [0u8; 6];
    timeout(Duration::from_secs(5), tls.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"HELLO\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_tls_handshake_reports_and_loop_continues() {
    let certificate = generate_certificate("badclient");
    let (server, addr, events) = start_tls_server(&certificate, TlsVersion::Tls).await;

    // A plaintext client on a TLS port fails the handshake.
    {
        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain.write_all(b"this is not a client hello").await.unwrap();
        let mut buf = [0u8; 16];
        let _ = timeout(Duration::from_secs(5), plain.read(&mut buf)).await;
    }

    timeout(Duration::from_secs(5), async {
        while events.inner_errors.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("TLS failure must surface as an inner error");

    // The accept loop keeps serving proper clients.
    let connector = client_connector(certificate.roots);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"y").await.unwrap();
    let mut reply = [0u8; 6];
    timeout(Duration::from_secs(5), tls.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"HELLO\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_certificate_fails_start() {
    let host = HostOptions::new(0)
        .with_address("127.0.0.1".parse().unwrap())
        .with_tls(
            TlsVersion::Tls,
            CertificateOptions::new("/nonexistent/cert.pem", "/nonexistent/key.pem"),
        );

    let server = Server::new(ServerOptions::default().with_host(host));
    server.use_protocol(Arc::new(EchoAnything));

    let result = server.start().await;
    assert!(matches!(result, Err(ServerError::Certificate(_))));
    assert!(!server.is_running());
}
