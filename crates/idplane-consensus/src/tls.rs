//! Mutual TLS for peer connections.
//!
//! Server and client share one certificate/key pair and one CA bundle. Both
//! sides verify the peer certificate against the bundle, and only TLS 1.2 and
//! 1.3 are offered.
use crate::error::{ConsensusError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    /// Name expected in peer certificates when dialing.
    pub server_name: String,
}

#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn load(settings: &TlsSettings) -> Result<Self> {
        let certs = load_certs(&settings.cert_path)?;
        let key = load_private_key(&settings.key_path)?;
        let roots = Arc::new(load_roots(&settings.ca_path)?);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|err| ConsensusError::Tls(format!("client verifier: {err}")))?;
        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(tls_err)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(tls_err)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(tls_err)?;

        let server_name = ServerName::try_from(settings.server_name.clone())
            .map_err(|err| ConsensusError::Tls(format!("server name: {err}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            server_name,
        })
    }
}

fn tls_err(err: rustls::Error) -> ConsensusError {
    ConsensusError::Tls(err.to_string())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|err| ConsensusError::Tls(format!("read {}: {err}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| ConsensusError::Tls(format!("parse {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(ConsensusError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|err| ConsensusError::Tls(format!("read {}: {err}", path.display())))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|err| ConsensusError::Tls(format!("parse {}: {err}", path.display())))?
        .ok_or_else(|| ConsensusError::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|err| ConsensusError::Tls(format!("ca bundle: {err}")))?;
    }
    Ok(roots)
}
