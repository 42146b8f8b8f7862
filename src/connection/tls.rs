//! TLS configuration for FTPS control connections.
//!
//! Root certificates, CRLs and the crypto provider are loaded once per run and
//! shared. The rustls `ClientConfig` itself is rebuilt for every connection so
//! each cycle owns (and must tear down) its own TLS context.

use super::config::{CertificateValidation, ConnectionConfig, SecurityProfile, TlsVersion};
use crate::error::ConnectError;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::{CipherSuite, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Shared TLS material for one run
///
/// # Examples
///
/// ```ignore
/// let tls = TlsConfig::new(&config)?;
///
/// // One fresh rustls context per connection
/// let client_config = tls.client_config()?;
/// ```
#[derive(Clone)]
pub struct TlsConfig {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static rustls::SupportedProtocolVersion>,
    validation: CertificateValidation,
    roots: Arc<RootCertStore>,
    crls: Vec<CertificateRevocationListDer<'static>>,
}

impl TlsConfig {
    /// Load roots, CRLs and cipher policy for the given connection config.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the protocol filter leaves no supported version
    /// - the CA or CRL files cannot be read or contain no usable entries
    /// - no root certificates can be found for strict validation
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let versions = config
            .tls
            .protocols
            .resolve()?
            .into_iter()
            .filter_map(|v| match v {
                TlsVersion::Tls12 => Some(&rustls::version::TLS12),
                TlsVersion::Tls13 => Some(&rustls::version::TLS13),
                _ => None,
            })
            .collect();

        let provider = Arc::new(provider_for(config.tls.security_profile)?);

        let roots = if config.validation.verifies_chain() {
            match &config.tls.ca_cert_path {
                Some(path) => load_custom_ca(path)?,
                None => load_system_roots(),
            }
        } else {
            RootCertStore::empty()
        };

        let crls = if config.validation == CertificateValidation::StrictWithRevocation {
            let mut crls = Vec::new();
            for path in &config.tls.crl_paths {
                crls.extend(load_crls(path)?);
            }
            crls
        } else {
            Vec::new()
        };

        let tls = Self {
            provider,
            versions,
            validation: config.validation,
            roots: Arc::new(roots),
            crls,
        };

        // Surface builder errors at startup rather than on the first cycle
        tls.client_config()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(tls)
    }

    /// Build a fresh rustls `ClientConfig`
    pub fn client_config(&self) -> std::result::Result<Arc<ClientConfig>, ConnectError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| ConnectError::Tls(format!("unsupported protocol versions: {}", e)))?;

        let builder = match self.validation {
            CertificateValidation::AcceptAny => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate {
                    algorithms: self.provider.signature_verification_algorithms,
                })),
            CertificateValidation::Strict => builder.with_root_certificates(self.roots.clone()),
            CertificateValidation::StrictWithRevocation => {
                let verifier = WebPkiServerVerifier::builder_with_provider(
                    self.roots.clone(),
                    self.provider.clone(),
                )
                .with_crls(self.crls.clone())
                .build()
                .map_err(|e| ConnectError::Tls(format!("failed to build verifier: {}", e)))?;
                builder.with_webpki_verifier(verifier)
            }
        };

        Ok(Arc::new(builder.with_no_client_auth()))
    }

    /// Certificate validation policy in effect
    pub fn validation(&self) -> CertificateValidation {
        self.validation
    }

    /// Number of cipher suites offered
    pub fn cipher_suite_count(&self) -> usize {
        self.provider.cipher_suites.len()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("versions", &self.versions)
            .field("validation", &self.validation)
            .field("roots", &self.roots.len())
            .field("crls", &self.crls.len())
            .field("cipher_suites", &self.provider.cipher_suites.len())
            .finish()
    }
}

/// Crypto provider with cipher suites selected by the security profile
fn provider_for(profile: SecurityProfile) -> Result<CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();

    match profile {
        SecurityProfile::Normal => {}
        SecurityProfile::Secure256 => {
            provider.cipher_suites.retain(|suite| {
                matches!(
                    suite.suite(),
                    CipherSuite::TLS13_AES_256_GCM_SHA384
                        | CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
                        | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
                        | CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
                        | CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
                        | CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
                )
            });
        }
        SecurityProfile::Performance => {
            provider.cipher_suites.sort_by_key(|suite| {
                !matches!(
                    suite.suite(),
                    CipherSuite::TLS13_AES_128_GCM_SHA256
                        | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
                        | CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
                )
            });
        }
    }

    if provider.cipher_suites.is_empty() {
        return Err(Error::Config(format!(
            "security profile {:?} leaves no cipher suites",
            profile
        )));
    }
    Ok(provider)
}

/// System roots, falling back to the bundled webpki roots
fn load_system_roots() -> RootCertStore {
    let result = rustls_native_certs::load_native_certs();

    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(result.certs);

    if added == 0 {
        tracing::warn!(
            errors = result.errors.len(),
            "no usable system root certificates, using bundled webpki roots"
        );
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    store
}

/// Load a custom CA bundle from a PEM file
fn load_custom_ca(path: &Path) -> Result<RootCertStore> {
    let data = fs::read(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read CA certificate file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut reader = std::io::Cursor::new(&data);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| {
            Error::Config(format!(
                "Failed to parse CA certificate from '{}'",
                path.display()
            ))
        })?;

    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::Config(format!(
            "No valid certificates found in '{}'",
            path.display()
        )));
    }

    Ok(store)
}

/// Load certificate revocation lists from a PEM file
fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let data = fs::read(path).map_err(|e| {
        Error::Config(format!("Failed to read CRL file '{}': {}", path.display(), e))
    })?;

    let mut reader = std::io::Cursor::new(&data);
    let crls: Vec<CertificateRevocationListDer<'static>> = rustls_pemfile::crls(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Config(format!("Failed to parse CRL from '{}'", path.display())))?;

    if crls.is_empty() {
        return Err(Error::Config(format!(
            "No CRLs found in '{}'",
            path.display()
        )));
    }
    Ok(crls)
}

/// Verifier that accepts every server certificate.
///
/// Handshake signatures are still checked so the session keys are bound to
/// the presented certificate; only chain and name validation are skipped.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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

/// Parse a host into a TLS server name (SNI / certificate name check).
///
/// IP addresses are accepted as-is; anything else must be a plausible DNS name.
///
/// # Errors
///
/// Returns an error if the hostname is invalid.
pub fn parse_server_name(hostname: &str) -> std::result::Result<ServerName<'static>, ConnectError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }

    // Remove trailing dot if present
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty()
        || hostname.len() > 253
        || !hostname
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ConnectError::Tls(format!(
            "Invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    ServerName::try_from(hostname.to_string())
        .map_err(|_| ConnectError::Tls(format!("Invalid hostname for TLS: '{}'", hostname)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::{ProtocolFilter, TlsProfile};

    fn permissive(profile: SecurityProfile) -> ConnectionConfig {
        ConnectionConfig::builder("localhost", "ftptest")
            .profile(TlsProfile::ExplicitPermissive)
            .security_profile(profile)
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_permissive_config_builds_without_roots() {
        let tls = TlsConfig::new(&permissive(SecurityProfile::Normal)).unwrap();
        assert_eq!(tls.validation(), CertificateValidation::AcceptAny);
        assert!(tls.client_config().is_ok());
    }

    #[test]
    fn test_each_client_config_is_fresh() {
        let tls = TlsConfig::new(&permissive(SecurityProfile::Normal)).unwrap();
        let a = tls.client_config().unwrap();
        let b = tls.client_config().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_secure256_drops_aes128() {
        let normal = TlsConfig::new(&permissive(SecurityProfile::Normal)).unwrap();
        let strong = TlsConfig::new(&permissive(SecurityProfile::Secure256)).unwrap();
        assert!(strong.cipher_suite_count() > 0);
        assert!(strong.cipher_suite_count() < normal.cipher_suite_count());
    }

    #[test]
    fn test_tls13_only() {
        let config = ConnectionConfig::builder("localhost", "u")
            .profile(TlsProfile::ExplicitPermissive)
            .protocols(ProtocolFilter {
                include: vec![TlsVersion::Tls13],
                exclude: vec![],
            })
            .build()
            .unwrap();
        let tls = TlsConfig::new(&config).unwrap();
        assert_eq!(tls.versions.len(), 1);
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let config = ConnectionConfig::builder("localhost", "u")
            .ca_cert_path("/nonexistent/ca.pem")
            .build()
            .unwrap();
        let err = TlsConfig::new(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_server_name_valid() {
        assert!(parse_server_name("localhost").is_ok());
        assert!(parse_server_name("ftp.example.com").is_ok());
        assert!(parse_server_name("ftp.example.com.").is_ok());
    }

    #[test]
    fn test_parse_server_name_ip() {
        let name = parse_server_name("127.0.0.1").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
        assert!(parse_server_name("::1").is_ok());
    }

    #[test]
    fn test_parse_server_name_invalid() {
        assert!(parse_server_name("").is_err());
        assert!(parse_server_name("bad host").is_err());
        assert!(parse_server_name("example.com:21").is_err());
    }
}
