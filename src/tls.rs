//! TLS Factory (spec.md §4.1)
//!
//! Builds the two transport configurations the rest of the system runs
//! over: a public config for the distributor's client-facing listener, and
//! an internal mutual-TLS config used for every intra-cluster hop (worker
//! RPC, peer replication fan-out). Both restrict to a single modern AEAD
//! cipher suite, one curve, and TLS 1.2+ — a requirement with no teacher
//! precedent (the teacher's own `imap.rs` builds a plain default
//! `rustls::ClientConfig`), so the restriction is built directly against
//! `rustls`'s `CryptoProvider` knobs rather than imitated from the pack.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use rustls_pki_types::pem::PemObject;

use crate::errors::{AppError, AppResult};

/// Load a certificate chain (PEM) from disk.
pub fn load_certs(path: &Path) -> AppResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| AppError::config(format!("cannot open cert file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::config(format!("cannot parse cert file {path:?}: {e}")))
}

/// Load a single private key (PEM, PKCS#8 or RSA) from disk.
pub fn load_private_key(path: &Path) -> AppResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| AppError::config(format!("cannot open key file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AppError::config(format!("cannot parse key file {path:?}: {e}")))?
        .ok_or_else(|| AppError::config(format!("no private key found in {path:?}")))
}

/// Load a root CA pool from a single PEM file.
pub fn load_root_store(path: &Path) -> AppResult<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| AppError::config(format!("invalid root CA in {path:?}: {e}")))?;
    }
    Ok(store)
}

/// Build the public listener's server config: TLS 1.2+, server-preferred
/// cipher order, a single AEAD/forward-secrecy suite, one certificate, no
/// client-cert verification.
pub fn build_public_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> AppResult<Arc<RustlsServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = restricted_crypto_provider();
    let config = RustlsServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| AppError::config(format!("unsupported TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::config(format!("invalid public server certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// Build the internal mTLS server config: same baseline as the public
/// config, plus `RequireAndVerifyClientCert` against the private root CA.
/// Both sides of every intra-cluster connection present a certificate
/// signed by that root; identity is inferred from the certificate.
pub fn build_internal_server_config(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> AppResult<Arc<RustlsServerConfig>> {
    let roots = load_root_store(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| AppError::config(format!("cannot build client cert verifier: {e}")))?;

    let provider = restricted_crypto_provider();
    let config = RustlsServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| AppError::config(format!("unsupported TLS protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| AppError::config(format!("invalid internal server certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// Build the internal mTLS client config used when the distributor or a
/// replicator dials a peer: the same private root both verifies the peer
/// and signs our own presented certificate.
pub fn build_internal_client_config(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> AppResult<Arc<rustls::ClientConfig>> {
    let roots = load_root_store(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = restricted_crypto_provider();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| AppError::config(format!("unsupported TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| AppError::config(format!("invalid internal client certificate: {e}")))?;

    Ok(Arc::new(config))
}

/// A crypto provider restricted to one NIST P-256-equivalent curve and one
/// AEAD cipher suite with forward secrecy, per spec.md §4.1.
fn restricted_crypto_provider() -> rustls::crypto::CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.kx_groups = vec![rustls::crypto::ring::kx_group::SECP256R1];
    provider.cipher_suites = vec![rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256];
    provider
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use std::io::Write;

    fn write_pem(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn self_signed(dir: &tempfile::TempDir, stem: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let key_pair = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let cert_path = write_pem(dir, &format!("{stem}.crt"), cert.pem().as_str());
        let key_path = write_pem(dir, &format!("{stem}.key"), key_pair.serialize_pem().as_str());
        (cert_path, key_path)
    }

    #[test]
    fn builds_public_server_config_from_generated_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = self_signed(&dir, "public");
        build_public_server_config(&cert_path, &key_path).expect("public config should build");
    }

    #[test]
    fn builds_internal_mtls_configs_from_shared_root() {
        let dir = tempfile::tempdir().unwrap();
        let (ca_path, ca_key_path) = self_signed(&dir, "root");
        let (cert_path, key_path) = self_signed(&dir, "node");
        let _ = ca_key_path;

        build_internal_server_config(&ca_path, &cert_path, &key_path)
            .expect("internal server config should build");
        build_internal_client_config(&ca_path, &cert_path, &key_path)
            .expect("internal client config should build");
    }

    #[test]
    fn rejects_missing_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.crt");
        let (_, key_path) = self_signed(&dir, "node");
        let err = build_public_server_config(&missing, &key_path).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
