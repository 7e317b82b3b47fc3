//! Mutual-TLS client configuration for the master connection.
//!
//! The master certificate is always verified against the CA bundle,
//! including its subject alternative names. There is no way to skip
//! verification.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use super::errors::TunnelError;

/// Build a rustls client config that presents `cert_path`/`key_path` and
/// trusts only the certificates in `ca_path`.
pub fn load_client_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<Arc<ClientConfig>, TunnelError> {
    let roots = load_roots(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| pem_error(key_path, e))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(tls_error)?;

    tracing::debug!(
        cert = %cert_path.display(),
        ca = %ca_path.display(),
        "loaded mTLS client config"
    );
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| pem_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls {
            reason: format!("no certificates found in {}", path.display()),
        });
    }
    Ok(certs)
}

fn load_roots(ca_path: &Path) -> Result<RootCertStore, TunnelError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).map_err(|e| TunnelError::Tls {
            reason: format!("invalid CA certificate in {}: {e}", ca_path.display()),
        })?;
    }
    Ok(roots)
}

fn pem_error(path: &Path, e: rustls::pki_types::pem::Error) -> TunnelError {
    match e {
        rustls::pki_types::pem::Error::Io(io) => TunnelError::Io {
            path: path.display().to_string(),
            reason: io.to_string(),
        },
        other => TunnelError::Tls {
            reason: format!("failed to parse {}: {other}", path.display()),
        },
    }
}

fn tls_error(e: rustls::Error) -> TunnelError {
    TunnelError::Tls {
        reason: e.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
