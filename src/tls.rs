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

//! TLS layer for secure hosts
//!
//! Builds a `tokio_rustls::TlsAcceptor` from a host's PEM certificate
//! material and version selector. The acceptor wraps accepted TCP streams
//! with server-authentication TLS; client certificates are not requested,
//! so any peer is accepted (the validation-bypass option makes this
//! explicit rather than changing behavior).

use crate::{CertificateOptions, Result, ServerError, TlsVersion};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Load the PEM certificate chain from disk
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ServerError::Certificate(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certificates: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ServerError::Certificate(format!("parse {}: {e}", path.display())))?;

    if certificates.is_empty() {
        return Err(ServerError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certificates)
}

/// Load the PEM private key (PKCS#8, PKCS#1 or SEC1) from disk
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ServerError::Certificate(format!("open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::Certificate(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            ServerError::Certificate(format!("no private key found in {}", path.display()))
        })
}

/// Map a version selector onto the rustls protocol versions to offer
///
/// rustls implements TLS 1.2 and 1.3 only; the legacy selectors fall back
/// to the full supported set.
fn protocol_versions(version: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match version {
        TlsVersion::Tls12 => TLS12_ONLY,
        TlsVersion::Tls13 => TLS13_ONLY,
        TlsVersion::Tls | TlsVersion::None => rustls::ALL_VERSIONS,
        TlsVersion::Tls11 => {
            warn!("TLS 1.1 is not supported by the TLS backend; offering 1.2/1.3");
            rustls::ALL_VERSIONS
        }
    }
}

/// Build a TLS acceptor for a secure host
///
/// `bypass_validation` records that any peer certificate is acceptable;
/// since the server never requests client certificates, both settings
/// accept every peer and the flag only affects logging.
pub fn build_acceptor(
    certificate: &CertificateOptions,
    version: TlsVersion,
    bypass_validation: bool,
) -> Result<TlsAcceptor> {
    let certs = load_certificates(&certificate.certificate)?;
    let key = load_private_key(&certificate.private_key)?;

    if bypass_validation {
        debug!("TLS peer validation bypass is on; all peer certificates accepted");
    }

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(protocol_versions(version))
    .map_err(|e| ServerError::Tls(format!("protocol versions: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::Tls(format!("certificate chain: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
