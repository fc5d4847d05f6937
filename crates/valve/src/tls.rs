//! TLS security contexts for listeners and outbound server connections.
//!
//! This is the security-context surface the relay needs: PEM material in,
//! ready-to-use rustls contexts out. A server context wraps client-facing
//! listener sockets (optionally demanding client certificates); a client
//! context wraps the outbound side toward the target server. Keystore
//! management beyond PEM files is out of scope.

use std::io::BufReader;
use std::sync::Arc;

use common::ValveError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::SecurityConfig;

/// Builds a rustls [`ServerConfig`] from PEM-encoded material.
///
/// When `client_ca_pem` is given, clients must present a certificate
/// signed by that CA bundle.
///
/// # Errors
///
/// Returns [`ValveError::Tls`] when the PEM material cannot be parsed or
/// rustls rejects the configuration.
pub fn build_server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: Option<&[u8]>,
) -> Result<Arc<ServerConfig>, ValveError> {
    let certs = load_certs(cert_pem)?;
    let key = load_key(key_pem)?;

    let builder = ServerConfig::builder();
    let config = match client_ca_pem {
        Some(ca_pem) => {
            let roots = root_store(ca_pem)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ValveError::Tls(format!("client certificate verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ValveError::Tls(format!("server configuration rejected: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds a rustls [`ClientConfig`] trusting `ca_pem`, optionally presenting
/// a client certificate to the server.
///
/// # Errors
///
/// Returns [`ValveError::Tls`] when the PEM material cannot be parsed or
/// rustls rejects the configuration.
pub fn build_client_config(
    ca_pem: &[u8],
    client_keypair: Option<(&[u8], &[u8])>,
) -> Result<Arc<ClientConfig>, ValveError> {
    let roots = root_store(ca_pem)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = match client_keypair {
        Some((cert_pem, key_pem)) => {
            let certs = load_certs(cert_pem)?;
            let key = load_key(key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ValveError::Tls(format!("client configuration rejected: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Builds the [`TlsAcceptor`] for a listener's named security context.
///
/// Requires `cert_path` and `key_path`; `certified` additionally requires
/// `ca_path` for client-certificate verification.
pub fn server_context(name: &str, cfg: &SecurityConfig) -> Result<TlsAcceptor, ValveError> {
    let cert_pem = read_pem(name, cfg.cert_path.as_deref(), "cert_path")?;
    let key_pem = read_pem(name, cfg.key_path.as_deref(), "key_path")?;
    let ca_pem = if cfg.certified {
        Some(read_pem(name, cfg.ca_path.as_deref(), "ca_path")?)
    } else {
        None
    };

    let config = build_server_config(&cert_pem, &key_pem, ca_pem.as_deref())?;
    Ok(TlsAcceptor::from(config))
}

/// Builds the [`TlsConnector`] for an outbound security context.
///
/// Requires `ca_path` (the trust anchors for the target server); a client
/// certificate is presented when `cert_path`/`key_path` are both set.
pub fn client_context(name: &str, cfg: &SecurityConfig) -> Result<TlsConnector, ValveError> {
    let keypair_paths = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
        (None, None) => None,
        _ => {
            return Err(ValveError::Tls(format!(
                "security context {name:?}: cert_path and key_path must be set together"
            )))
        }
    };

    let ca_pem = read_pem(name, cfg.ca_path.as_deref(), "ca_path")?;
    let keypair = match keypair_paths {
        Some((cert, key)) => Some((
            read_pem(name, Some(cert), "cert_path")?,
            read_pem(name, Some(key), "key_path")?,
        )),
        None => None,
    };

    let config = build_client_config(
        &ca_pem,
        keypair.as_ref().map(|(cert, key)| (cert.as_slice(), key.as_slice())),
    )?;
    Ok(TlsConnector::from(config))
}

/// Parses the SNI name used when connecting out to `host`.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ValveError> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| ValveError::Tls(format!("invalid TLS server name {host:?}")))
}

fn read_pem(context: &str, path: Option<&str>, field: &str) -> Result<Vec<u8>, ValveError> {
    let path = path.ok_or_else(|| {
        ValveError::Tls(format!("security context {context:?}: {field} is required"))
    })?;
    std::fs::read(path)
        .map_err(|e| ValveError::Tls(format!("security context {context:?}: {path}: {e}")))
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ValveError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ValveError::Tls(format!("failed to parse certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(ValveError::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ValveError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| ValveError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| ValveError::Tls("no private key found in PEM data".into()))
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, ValveError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| ValveError::Tls(format!("rejected CA certificate: {e}")))?;
    }
    Ok(roots)
}
