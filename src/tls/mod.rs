//! TLS over non-blocking sockets
//!
//! A [`TlsContext`] holds the rustls configuration for one side and is
//! shared by every session of that side. Client contexts trust the bundled
//! webpki roots plus an optional CA file; hostname checks are done after
//! the handshake by [`verify`].

mod handshake;
mod session;
pub mod verify;

pub use handshake::TlsHandshakeCommand;
pub use session::TlsSession;

use crate::config::TlsConfig;
use crate::error::{EngineError, Result, TlsErrorKind};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use verify::{AcceptAnyCertificate, ChainVerifier};

/// Negotiated protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls11,
    Tls12,
    Tls13,
    /// Nothing negotiated yet, or a version this engine does not name
    Unknown,
}

impl TlsVersion {
    pub(crate) fn from_rustls(version: Option<ProtocolVersion>) -> Self {
        match version {
            Some(ProtocolVersion::TLSv1_1) => Self::Tls11,
            Some(ProtocolVersion::TLSv1_2) => Self::Tls12,
            Some(ProtocolVersion::TLSv1_3) => Self::Tls13,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls11 => write!(f, "TLSv1.1"),
            Self::Tls12 => write!(f, "TLSv1.2"),
            Self::Tls13 => write!(f, "TLSv1.3"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Which end of the connection a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSide {
    Client,
    Server,
}

/// Lifecycle of a [`TlsSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Handshaking,
    Established,
    Closed,
    Failed,
}

/// Result of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete(TlsVersion),
    WouldBlock(crate::net::Want),
}

/// Shared TLS configuration for one side
#[derive(Debug, Clone)]
pub struct TlsContext {
    side: TlsSide,
    verify_peer: bool,
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsContext {
    /// Client context from the engine TLS options
    pub fn client(config: &TlsConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &config.ca_certificate {
            let added = add_ca_file(&mut roots, path)?;
            tracing::debug!("Loaded {} CA certificate(s) from {:?}", added, path);
        }

        let verifier: Arc<dyn ServerCertVerifier> = if config.verify_peer {
            let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|e| EngineError::tls(TlsErrorKind::Config, e.to_string()))?;
            Arc::new(ChainVerifier::new(inner))
        } else {
            tracing::warn!("TLS peer verification is disabled");
            Arc::new(AcceptAnyCertificate::new(Arc::clone(&provider)))
        };

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            side: TlsSide::Client,
            verify_peer: config.verify_peer,
            client: Some(Arc::new(client)),
            server: None,
        })
    }

    /// Server context presenting `cert_chain`
    pub fn server(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Ok(Self {
            side: TlsSide::Server,
            verify_peer: false,
            client: None,
            server: Some(Arc::new(server)),
        })
    }

    /// Server context from PEM certificate chain and private key files
    pub fn server_from_pem(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut reader = BufReader::new(open(cert_path)?);
        let chain = rustls_pemfile::certs(&mut reader)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| EngineError::storage(cert_path, e.to_string()))?;
        if chain.is_empty() {
            return Err(EngineError::tls(
                TlsErrorKind::Config,
                format!("no certificate in {:?}", cert_path),
            ));
        }

        let mut reader = BufReader::new(open(key_path)?);
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| EngineError::storage(key_path, e.to_string()))?
            .ok_or_else(|| {
                EngineError::tls(TlsErrorKind::Config, format!("no private key in {:?}", key_path))
            })?;

        Self::server(chain, key)
    }

    pub fn side(&self) -> TlsSide {
        self.side
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub(crate) fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.clone()
    }

    pub(crate) fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.clone()
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| EngineError::storage(path, e.to_string()))
}

fn add_ca_file(roots: &mut RootCertStore, path: &Path) -> Result<usize> {
    let mut reader = BufReader::new(open(path)?);
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| EngineError::storage(path, e.to_string()))?;
        roots.add(cert)?;
        added += 1;
    }
    if added == 0 {
        return Err(EngineError::tls(
            TlsErrorKind::Config,
            format!("no certificate in {:?}", path),
        ));
    }
    Ok(added)
}
