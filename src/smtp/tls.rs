//! STARTTLS support: loads the configured PEM keypair into a rustls
//! acceptor shared by every session.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds a `TlsAcceptor` from PEM certificate chain and private key
/// files. Called once at server construction; a bad keypair is a
/// startup error, not a per-session one.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    // Several dependencies compile in rustls crypto backends; pin the
    // process-wide default before building any config. Ignores the
    // error when one is already installed.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();

    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open TLS certificate file {cert_path}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse TLS certificate file {cert_path}"))?;

    let mut key_reader = BufReader::new(
        File::open(key_path)
            .with_context(|| format!("failed to open TLS private key file {key_path}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("failed to parse TLS private key file {key_path}"))?
        .ok_or_else(|| anyhow!("no private key found in {key_path}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS certificate and private key do not form a valid keypair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
