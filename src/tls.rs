//! TLS server configuration: load certificates from PEM files and build the
//! acceptor used by ldaps:// listeners and StartTLS.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a rustls ServerConfig from PEM certificate and key files. With a CA
/// file, clients must present a certificate issued by one of its CAs.
pub fn load_server_config_from_files(
    cert_file: &Path,
    key_file: &Path,
    ca_file: Option<&Path>,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let builder = rustls::ServerConfig::builder();
    let builder = match ca_file {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs_from_file(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Add CA certificate from {}", ca.display()))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("Build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let config = builder
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Open key file: {}", path.display()))?;
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Check that cert and key files exist and load (for startup validation).
pub fn validate_tls_files(cert_file: &Path, key_file: &Path, ca_file: Option<&Path>) -> Result<()> {
    if !cert_file.exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file.display());
    }
    if !key_file.exists() {
        anyhow::bail!("TLS key file not found: {}", key_file.display());
    }
    if let Some(ca) = ca_file {
        if !ca.exists() {
            anyhow::bail!("TLS CA file not found: {}", ca.display());
        }
    }
    load_server_config_from_files(cert_file, key_file, ca_file)?;
    Ok(())
}

pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    validate_tls_files(&config.cert_file, &config.key_file, config.ca_file.as_deref())?;
    let server_config =
        load_server_config_from_files(&config.cert_file, &config.key_file, config.ca_file.as_deref())?;
    Ok(TlsAcceptor::from(server_config))
}
