//! TLS configuration attached to listeners and dialers.
//!
//! The core treats a [`TlsConfig`] as an opaque value: it is built once,
//! handed to an endpoint through the `tls-config` option (or assembled
//! lazily from the `tls-ca-file` / `tls-cert-key-file` string options), and
//! forwarded to the `tls+tcp` transport untouched. Certificate parsing is
//! rustls/pemfile territory, not ours.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::warn;

use crate::error::{Error, Result};

/// Whether a config describes the connecting or the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

/// How hard the local side insists on authenticating the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsAuthMode {
    /// No peer verification. Clients accept any server certificate.
    None,
    /// Servers request, but do not require, a client certificate.
    Optional,
    /// Peer must present a certificate that chains to a trusted CA.
    Required,
}

impl TlsAuthMode {
    pub(crate) fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(TlsAuthMode::None),
            1 => Ok(TlsAuthMode::Optional),
            2 => Ok(TlsAuthMode::Required),
            _ => Err(Error::InvalidOperation),
        }
    }

    pub(crate) fn as_i32(self) -> i32 {
        match self {
            TlsAuthMode::None => 0,
            TlsAuthMode::Optional => 1,
            TlsAuthMode::Required => 2,
        }
    }
}

/// An opaque, shareable TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    inner: Arc<Inner>,
}

struct Inner {
    mode: TlsMode,
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<String>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("mode", &self.inner.mode)
            .field("server_name", &self.inner.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Start building a configuration for the given side.
    pub fn builder(mode: TlsMode) -> TlsConfigBuilder {
        TlsConfigBuilder {
            mode,
            ca_file: None,
            ca_pem: None,
            cert_key_file: None,
            cert_pem: None,
            auth_mode: None,
            server_name: None,
        }
    }

    pub fn mode(&self) -> TlsMode {
        self.inner.mode
    }

    /// Expected server name for client handshakes, when overridden.
    pub(crate) fn server_name(&self) -> Option<&str> {
        self.inner.server_name.as_deref()
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.inner.client.clone().ok_or_else(|| {
            warn!("server-mode TLS config used on a dialer");
            Error::CryptoError
        })
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.inner.server.clone().ok_or_else(|| {
            warn!("client-mode TLS config used on a listener");
            Error::CryptoError
        })
    }
}

/// Builder mirroring the option surface: trust anchors, own certificate,
/// auth mode and server-name override.
#[derive(Debug)]
pub struct TlsConfigBuilder {
    mode: TlsMode,
    ca_file: Option<PathBuf>,
    ca_pem: Option<String>,
    cert_key_file: Option<PathBuf>,
    cert_pem: Option<(String, String)>,
    auth_mode: Option<TlsAuthMode>,
    server_name: Option<String>,
}

impl TlsConfigBuilder {
    /// Trust the CA certificates found in a PEM file.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Trust the CA certificates in a PEM string.
    pub fn ca_string(mut self, pem: impl Into<String>) -> Self {
        self.ca_pem = Some(pem.into());
        self
    }

    /// Use our own certificate chain and private key from a single PEM file.
    pub fn cert_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_key_file = Some(path.into());
        self
    }

    /// Use our own certificate chain and private key from PEM strings.
    pub fn cert_key_strings(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.cert_pem = Some((cert_pem.into(), key_pem.into()));
        self
    }

    pub fn auth_mode(mut self, mode: TlsAuthMode) -> Self {
        self.auth_mode = Some(mode);
        self
    }

    /// Override the server name clients expect during verification.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig> {
        let inner = match self.mode {
            TlsMode::Client => {
                let auth = self.auth_mode.unwrap_or(TlsAuthMode::Required);
                let config = match auth {
                    TlsAuthMode::None => ClientConfig::builder()
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                        .with_no_client_auth(),
                    _ => {
                        let roots = self.load_roots()?;
                        if roots.is_empty() {
                            warn!("TLS client requires verification but no CA was provided");
                            return Err(Error::CryptoError);
                        }
                        let builder = ClientConfig::builder().with_root_certificates(roots);
                        match self.load_own_cert()? {
                            Some((chain, key)) => builder
                                .with_client_auth_cert(chain, key)
                                .map_err(|e| crypto_err("client certificate rejected", e))?,
                            None => builder.with_no_client_auth(),
                        }
                    }
                };
                Inner {
                    mode: TlsMode::Client,
                    client: Some(Arc::new(config)),
                    server: None,
                    server_name: self.server_name,
                }
            }
            TlsMode::Server => {
                let (chain, key) = self.load_own_cert()?.ok_or_else(|| {
                    warn!("TLS server config needs a certificate and key");
                    Error::NoArgument
                })?;
                let auth = self.auth_mode.unwrap_or(TlsAuthMode::None);
                let builder = match auth {
                    TlsAuthMode::None => ServerConfig::builder().with_no_client_auth(),
                    _ => {
                        let roots = self.load_roots()?;
                        let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
                        let verifier = if auth == TlsAuthMode::Optional {
                            verifier.allow_unauthenticated()
                        } else {
                            verifier
                        };
                        let verifier = verifier
                            .build()
                            .map_err(|e| crypto_err("client verifier setup failed", e))?;
                        ServerConfig::builder().with_client_cert_verifier(verifier)
                    }
                };
                let config = builder
                    .with_single_cert(chain, key)
                    .map_err(|e| crypto_err("server certificate rejected", e))?;
                Inner {
                    mode: TlsMode::Server,
                    client: None,
                    server: Some(Arc::new(config)),
                    server_name: self.server_name,
                }
            }
        };
        Ok(TlsConfig { inner: Arc::new(inner) })
    }

    fn load_roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        let mut pem = String::new();
        if let Some(path) = &self.ca_file {
            pem.push_str(&fs::read_to_string(path)?);
            pem.push('\n');
        }
        if let Some(extra) = &self.ca_pem {
            pem.push_str(extra);
        }
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            let cert = cert.map_err(|e| crypto_err("malformed CA certificate", e))?;
            roots
                .add(cert)
                .map_err(|e| crypto_err("CA certificate rejected", e))?;
        }
        Ok(roots)
    }

    fn load_own_cert(&self) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let pem = if let Some(path) = &self.cert_key_file {
            fs::read_to_string(path)?
        } else if let Some((cert, key)) = &self.cert_pem {
            format!("{cert}\n{key}")
        } else {
            return Ok(None);
        };

        let chain = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| crypto_err("malformed certificate chain", e))?;
        let key = rustls_pemfile::private_key(&mut pem.as_bytes())
            .map_err(|e| crypto_err("malformed private key", e))?
            .ok_or_else(|| {
                warn!("no private key found alongside certificate");
                Error::CryptoError
            })?;
        if chain.is_empty() {
            warn!("no certificate found in the supplied PEM data");
            return Err(Error::CryptoError);
        }
        Ok(Some((chain, key)))
    }
}

fn crypto_err(what: &str, err: impl fmt::Display) -> Error {
    warn!("{what}: {err}");
    Error::CryptoError
}

/// Verifier used for `TlsAuthMode::None` clients: every certificate passes,
/// signatures are still checked by rustls itself during the handshake.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
