//! Channel options for cloud connections.
//!
//! Proxied connections go to the local control proxy, which owns the real
//! cloud-facing TLS session; the gateway side presents the per-service
//! authority as the server name and does not authenticate the proxy. Direct
//! connections build a TLS configuration from the OS trust store, an optional
//! root CA, and an optional gateway client certificate.
//!
//! Certificate problems never fail a dial. They are logged and collected as
//! [`TlsWarning`]s on the resulting [`TlsMaterial`].
//!
//! An authority that is not a valid DNS name (an IP-literal cloud address,
//! for example) is replaced by a sanitized server name whenever the server
//! certificate is not verified. A verified direct dial cannot present such a
//! name and fails instead.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use thiserror::Error;

use crate::proxy_config::ProxyConfig;

/// Upper bound on a whole dial, also used as the minimum connect timeout of
/// each connection attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap on the delay between connection attempts.
pub const DEFAULT_MAX_BACKOFF_DELAY: Duration = Duration::from_secs(20);

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 1.6;

/// Presented when not even a sanitized authority is a valid server name.
const FALLBACK_SERVER_NAME: &str = "localhost";
/// Longest DNS label.
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid dial settings: {0}")]
    InvalidSettings(String),
    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("TLS configuration is not usable for QUIC: {0}")]
    Quic(String),
    #[error("cannot verify the cloud certificate for {name}: {reason}")]
    InvalidServerName { name: String, reason: String },
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_BACKOFF_DELAY,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after `retries` failed attempts.
    #[must_use]
    pub fn delay(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Connection parameters handed to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct DialSettings {
    /// Upper bound on a whole dial.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    /// Whether direct connections start from the OS trust store.
    pub load_native_roots: bool,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            backoff: BackoffConfig::default(),
            load_native_roots: true,
        }
    }
}

impl DialSettings {
    /// # Errors
    ///
    /// Returns an error if a timeout or backoff parameter is unusable.
    pub fn validate(&self) -> Result<(), DialError> {
        if self.timeout.is_zero() {
            return Err(DialError::InvalidSettings(
                "dial timeout must be positive".to_string(),
            ));
        }
        let backoff = &self.backoff;
        if backoff.base_delay.is_zero() {
            return Err(DialError::InvalidSettings(
                "backoff base delay must be positive".to_string(),
            ));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(DialError::InvalidSettings(format!(
                "backoff multiplier must be at least 1, got {}",
                backoff.multiplier
            )));
        }
        if backoff.max_delay < backoff.base_delay {
            return Err(DialError::InvalidSettings(format!(
                "backoff max delay {:?} is shorter than base delay {:?}",
                backoff.max_delay, backoff.base_delay
            )));
        }
        Ok(())
    }
}

/// The virtual host a cloud service is reached under.
///
/// Displayed as `<service>-<cloud_address>`. The TLS server name drops the
/// port from the cloud address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    service: String,
    cloud_address: String,
}

impl Authority {
    #[must_use]
    pub fn new(service: &str, cloud_address: &str) -> Self {
        Self {
            service: service.to_string(),
            cloud_address: cloud_address.to_string(),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn server_name(&self) -> String {
        format!("{}-{}", self.service, host_of(&self.cloud_address))
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.service, self.cloud_address)
    }
}

/// Returns the host part of a `host:port`, `[v6]:port` or bare host string.
pub(crate) fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    addr.split(':').next().unwrap_or(addr)
}

/// A non-fatal problem met while assembling TLS material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsWarning {
    #[error("OS certificate pool initialization error: {0}")]
    SystemRootsUnavailable(String),
    #[error("cannot load root CA from {}: {reason}", .path.display())]
    RootCaUnreadable { path: PathBuf, reason: String },
    #[error("failed to append certificates from {}", .path.display())]
    RootCaRejected { path: PathBuf },
    #[error("empty server certificate pool, skipping server certificate verification")]
    UnverifiedServer,
    #[error("gateway certificate location is not configured")]
    ClientCertMissing,
    #[error("gateway certificate key location is not configured")]
    ClientKeyMissing,
    #[error(
        "failed to load client certificate and key from {}, {}: {reason}",
        .cert.display(),
        .key.display()
    )]
    ClientIdentityUnloadable {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },
    #[error("server name {name} is unusable ({reason}), presenting {fallback} instead")]
    ServerNameReplaced {
        name: String,
        fallback: String,
        reason: String,
    },
}

/// Gateway certificate chain and private key presented for mutual TLS.
#[derive(Debug)]
pub struct ClientIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Trust anchors and client identity for a direct cloud connection.
#[derive(Debug)]
pub struct TlsMaterial {
    pub server_name: String,
    pub roots: RootCertStore,
    /// `false` when the trust pool ended up empty.
    pub verify_server: bool,
    pub client_identity: Option<ClientIdentity>,
    pub warnings: Vec<TlsWarning>,
}

impl TlsMaterial {
    /// Assembles TLS material for `server_name` from the control-proxy
    /// configuration. Every certificate problem degrades into a warning.
    #[must_use]
    pub fn build(cfg: &ProxyConfig, server_name: &str, load_native_roots: bool) -> Self {
        let mut material = Self {
            server_name: server_name.to_string(),
            roots: RootCertStore::empty(),
            verify_server: false,
            client_identity: None,
            warnings: Vec::new(),
        };

        if load_native_roots {
            material.add_native_roots();
        }
        if let Some(path) = cfg.rootca_cert() {
            material.add_root_ca(&path);
        }

        if material.roots.is_empty() {
            material.warn(TlsWarning::UnverifiedServer);
        } else {
            material.verify_server = true;
        }

        match (cfg.gateway_cert(), cfg.gateway_key()) {
            (Some(cert), Some(key)) => match load_client_identity(&cert, &key) {
                Ok(identity) => material.client_identity = Some(identity),
                Err(reason) => {
                    material.warn(TlsWarning::ClientIdentityUnloadable { cert, key, reason });
                }
            },
            (None, _) => material.warn(TlsWarning::ClientCertMissing),
            (Some(_), None) => material.warn(TlsWarning::ClientKeyMissing),
        }
        material
    }

    fn add_native_roots(&mut self) {
        let native = rustls_native_certs::load_native_certs();
        self.add_os_roots(native.certs, &native.errors);
    }

    fn add_os_roots<E: fmt::Display>(
        &mut self,
        certs: Vec<CertificateDer<'static>>,
        errors: &[E],
    ) {
        let reason = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if certs.is_empty() && !errors.is_empty() {
            self.warn(TlsWarning::SystemRootsUnavailable(reason));
            return;
        }
        if !errors.is_empty() {
            tracing::debug!(
                server_name = %self.server_name,
                "Some OS root certificates could not be loaded: {reason}"
            );
        }
        let (added, ignored) = self.roots.add_parsable_certificates(certs);
        tracing::debug!("Loaded {added} OS root certificates ({ignored} ignored)");
    }

    fn add_root_ca(&mut self, path: &Path) {
        let pem = match fs::read(path) {
            Ok(pem) => pem,
            Err(e) => {
                self.warn(TlsWarning::RootCaUnreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
                return;
            }
        };
        let certs = CertificateDer::pem_slice_iter(&pem).filter_map(Result::ok);
        let (added, _) = self.roots.add_parsable_certificates(certs);
        if added == 0 {
            self.warn(TlsWarning::RootCaRejected {
                path: path.to_path_buf(),
            });
        }
    }

    fn warn(&mut self, warning: TlsWarning) {
        tracing::warn!(server_name = %self.server_name, "{warning}");
        self.warnings.push(warning);
    }
}

fn load_client_identity(cert: &Path, key: &Path) -> Result<ClientIdentity, String> {
    let cert_pem = fs::read(cert).map_err(|e| e.to_string())?;
    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }

    let key_pem = fs::read(key).map_err(|e| e.to_string())?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|e| e.to_string())?;
    crypto_provider()
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| e.to_string())?;

    Ok(ClientIdentity { certs, key })
}

/// How the channel is secured.
#[derive(Debug)]
pub enum Transport {
    /// Through the local control proxy, without authenticating it.
    Proxied,
    /// Straight to the cloud.
    Tls(TlsMaterial),
}

/// Everything needed to establish one cloud channel.
#[derive(Debug)]
pub struct DialOptions {
    pub authority: Authority,
    pub transport: Transport,
    pub backoff: BackoffConfig,
    /// Bound on a single connection attempt.
    pub min_connect_timeout: Duration,
    /// Server-name substitutions, in either mode.
    pub warnings: Vec<TlsWarning>,
    server_name: String,
}

/// Builds the options for dialing `authority`, proxied or direct.
///
/// # Errors
///
/// Returns an error if `settings` is invalid, or if a direct dial that
/// verifies the cloud certificate has no valid server name for `authority`.
/// Other certificate problems are reported as warnings instead.
pub fn build_dial_options(
    cfg: &ProxyConfig,
    authority: &Authority,
    use_proxy: bool,
    settings: &DialSettings,
) -> Result<DialOptions, DialError> {
    settings.validate()?;

    let requested = authority.server_name();
    let transport = if use_proxy {
        tracing::debug!("Dialing {authority} through the control proxy");
        Transport::Proxied
    } else {
        Transport::Tls(TlsMaterial::build(cfg, &requested, settings.load_native_roots))
    };
    let verified = matches!(&transport, Transport::Tls(material) if material.verify_server);

    let mut warnings = Vec::new();
    let invalid = ServerName::try_from(requested.as_str()).err().map(|e| e.to_string());
    let server_name = match invalid {
        None => requested,
        Some(reason) if verified => {
            return Err(DialError::InvalidServerName {
                name: requested,
                reason,
            });
        }
        Some(reason) => {
            let fallback = fallback_server_name(&requested);
            let warning = TlsWarning::ServerNameReplaced {
                name: requested,
                fallback: fallback.clone(),
                reason,
            };
            tracing::warn!(authority = %authority, "{warning}");
            warnings.push(warning);
            fallback
        }
    };

    Ok(DialOptions {
        authority: authority.clone(),
        transport,
        backoff: settings.backoff,
        min_connect_timeout: settings.timeout,
        warnings,
        server_name,
    })
}

/// Folds `name` into a single DNS label.
fn fallback_server_name(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect();
    let label = label.trim_matches('-');
    if ServerName::try_from(label).is_ok() {
        label.to_string()
    } else {
        FALLBACK_SERVER_NAME.to_string()
    }
}

impl DialOptions {
    /// The TLS server name presented to the peer.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Builds the QUIC client configuration for these options.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be assembled.
    pub fn client_config(&self) -> Result<quinn::ClientConfig, DialError> {
        let crypto = match &self.transport {
            Transport::Proxied => unverified_builder()?.with_no_client_auth(),
            Transport::Tls(material) => tls_client_config(material)?,
        };
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| DialError::Quic(e.to_string()))?;
        Ok(quinn::ClientConfig::new(Arc::new(crypto)))
    }
}

type ClientConfigBuilder =
    rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn unverified_builder() -> Result<ClientConfigBuilder, DialError> {
    let provider = crypto_provider();
    Ok(
        rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider))),
    )
}

fn verified_builder(roots: &RootCertStore) -> Result<ClientConfigBuilder, DialError> {
    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots.clone()))
}

fn tls_client_config(material: &TlsMaterial) -> Result<rustls::ClientConfig, DialError> {
    let builder = || {
        if material.verify_server {
            verified_builder(&material.roots)
        } else {
            unverified_builder()
        }
    };

    let Some(identity) = &material.client_identity else {
        return Ok(builder()?.with_no_client_auth());
    };
    match builder()?.with_client_auth_cert(identity.certs.clone(), identity.key.clone_key()) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::warn!(
                server_name = %material.server_name,
                "Client certificate rejected, continuing without client identity: {e}"
            );
            Ok(builder()?.with_no_client_auth())
        }
    }
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
