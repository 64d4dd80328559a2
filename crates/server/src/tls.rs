//! TLS assembly for the two endpoints.
//!
//! The public endpoint authenticates the server only; the protected
//! endpoint additionally verifies client certificates against the
//! configured CA. Certificate material is addressed by the `file://`
//! URLs carried in [`CertInfo`]. In provisioning mode both endpoints run
//! without TLS.

use std::path::PathBuf;

use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tonic::Request;

use edgeiam_common::{IamError, Result};

use crate::collaborators::CertInfo;

/// Server-auth-only TLS for the public endpoint.
pub fn public_tls(cert: &CertInfo) -> Result<ServerTlsConfig> {
    Ok(ServerTlsConfig::new().identity(load_identity(cert)?))
}

/// Mutual TLS for the protected endpoint: server identity plus client
/// certificate verification against `ca_cert_path`.
pub fn protected_mtls(cert: &CertInfo, ca_cert_path: &str) -> Result<ServerTlsConfig> {
    let ca = std::fs::read(ca_cert_path)
        .map_err(|e| IamError::internal(format!("can't read CA cert {ca_cert_path}: {e}")))?;

    Ok(ServerTlsConfig::new()
        .identity(load_identity(cert)?)
        .client_ca_root(Certificate::from_pem(ca)))
}

fn load_identity(cert: &CertInfo) -> Result<Identity> {
    let cert_pem = read_url(&cert.cert_url)?;
    let key_pem = read_url(&cert.key_url)?;
    Ok(Identity::from_pem(cert_pem, key_pem))
}

/// Resolves a `file://` URL (or a bare path) to its contents.
fn read_url(url: &str) -> Result<Vec<u8>> {
    let path = url_to_path(url);
    std::fs::read(&path)
        .map_err(|e| IamError::internal(format!("can't read {}: {e}", path.display())))
}

/// Strips the `file://` scheme; bare paths pass through.
pub fn url_to_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Common name of the verified client certificate, when mTLS is in
/// force. `None` on plaintext or server-auth-only connections.
pub fn peer_identity<T>(request: &Request<T>) -> Option<String> {
    let certs = request.peer_certs()?;
    let cert = certs.first()?;

    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}
