//! Connection configuration
//!
//! A [`ConnectionConfig`] is built once per run and shared read-only by every
//! cycle. Named [`TlsProfile`] presets cover the common encryption and
//! certificate-validation combinations.

use crate::protocol::constants::{DEFAULT_IMPLICIT_PORT, DEFAULT_PORT};
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default TLS handshake timeout (5 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP connect and reply timeout (15 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How the control connection is encrypted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Plain FTP
    None,
    /// Connect in plaintext, then upgrade with `AUTH TLS`
    #[default]
    Explicit,
    /// TLS from the first byte (dedicated port)
    Implicit,
}

impl EncryptionMode {
    /// Whether this mode encrypts the control channel
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Conventional port for this mode
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Implicit => DEFAULT_IMPLICIT_PORT,
            _ => DEFAULT_PORT,
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Explicit => write!(f, "explicit"),
            Self::Implicit => write!(f, "implicit"),
        }
    }
}

impl std::str::FromStr for EncryptionMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "explicit" => Ok(Self::Explicit),
            "implicit" => Ok(Self::Implicit),
            _ => Err(Error::Config(format!(
                "invalid encryption mode '{}': expected none, explicit, or implicit",
                s
            ))),
        }
    }
}

/// How the server certificate is checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertificateValidation {
    /// Accept any certificate (development only)
    AcceptAny,
    /// Chain must verify against trusted roots and match the host name
    #[default]
    Strict,
    /// As `Strict`, and the chain is checked against the configured CRLs
    StrictWithRevocation,
}

impl CertificateValidation {
    /// Whether the chain is verified at all
    pub fn verifies_chain(&self) -> bool {
        !matches!(self, Self::AcceptAny)
    }
}

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// All versions, oldest first
    pub const ALL: [TlsVersion; 4] = [Self::Tls10, Self::Tls11, Self::Tls12, Self::Tls13];

    /// Whether the TLS stack can negotiate this version
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Tls12 | Self::Tls13)
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls10 => write!(f, "tls1.0"),
            Self::Tls11 => write!(f, "tls1.1"),
            Self::Tls12 => write!(f, "tls1.2"),
            Self::Tls13 => write!(f, "tls1.3"),
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls1.0" | "tls10" => Ok(Self::Tls10),
            "tls1.1" | "tls11" => Ok(Self::Tls11),
            "tls1.2" | "tls12" => Ok(Self::Tls12),
            "tls1.3" | "tls13" => Ok(Self::Tls13),
            _ => Err(Error::Config(format!(
                "invalid TLS version '{}': expected tls1.0, tls1.1, tls1.2, or tls1.3",
                s
            ))),
        }
    }
}

/// Include/exclude list of TLS protocol versions
///
/// An empty include list means every version. Exclusions are applied after
/// inclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolFilter {
    /// Versions to allow (empty = all)
    pub include: Vec<TlsVersion>,
    /// Versions to remove from the allowed set
    pub exclude: Vec<TlsVersion>,
}

impl ProtocolFilter {
    /// Allow every version
    pub fn all() -> Self {
        Self::default()
    }

    /// Resolve to the versions the TLS stack will offer, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if no supported version remains.
    pub fn resolve(&self) -> Result<Vec<TlsVersion>> {
        let versions: Vec<TlsVersion> = TlsVersion::ALL
            .into_iter()
            .filter(|v| self.include.is_empty() || self.include.contains(v))
            .filter(|v| !self.exclude.contains(v))
            .filter(TlsVersion::is_supported)
            .collect();

        if versions.is_empty() {
            return Err(Error::Config(format!(
                "TLS protocol filter leaves no supported version (include={:?}, exclude={:?})",
                self.include, self.exclude
            )));
        }
        Ok(versions)
    }
}

/// Cipher-suite selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityProfile {
    /// Every suite the provider offers, in its preference order
    #[default]
    Normal,
    /// Only suites with 256-bit strength (AES-256-GCM, ChaCha20-Poly1305)
    Secure256,
    /// Every suite, AES-128 first
    Performance,
}

impl std::str::FromStr for SecurityProfile {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "secure256" => Ok(Self::Secure256),
            "performance" => Ok(Self::Performance),
            _ => Err(Error::Config(format!(
                "invalid security profile '{}': expected normal, secure256, or performance",
                s
            ))),
        }
    }
}

/// Transport-layer security options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Protocol version include/exclude list
    pub protocols: ProtocolFilter,
    /// Cipher-suite policy
    pub security_profile: SecurityProfile,
    /// Limit for the TLS handshake
    pub handshake_timeout: Duration,
    /// Custom CA bundle (PEM). `None` uses the system roots
    pub ca_cert_path: Option<PathBuf>,
    /// CRL files (PEM) for [`CertificateValidation::StrictWithRevocation`]
    pub crl_paths: Vec<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            protocols: ProtocolFilter::all(),
            security_profile: SecurityProfile::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ca_cert_path: None,
            crl_paths: Vec::new(),
        }
    }
}

/// Connection configuration
///
/// Immutable once built. Use [`ConnectionConfig::builder`] to create one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Server host name or address
    pub host: String,
    /// Control port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Login password (optional)
    pub password: Option<String>,
    /// Control-channel encryption
    pub encryption: EncryptionMode,
    /// Certificate validation policy
    pub validation: CertificateValidation,
    /// TLS options
    pub tls: TlsOptions,
    /// Limit for the TCP connect and for each server reply
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a builder for the given host and user
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ConnectionConfig::builder("127.0.0.1", "ftptest")
    ///     .password("ftptest")
    ///     .profile(TlsProfile::ExplicitStrict)
    ///     .handshake_timeout(Duration::from_secs(5))
    ///     .build()?;
    /// ```
    pub fn builder(host: impl Into<String>, user: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            host: host.into(),
            port: None,
            user: user.into(),
            password: None,
            encryption: EncryptionMode::default(),
            validation: CertificateValidation::default(),
            tls: TlsOptions::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// `host:port` for logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    host: String,
    port: Option<u16>,
    user: String,
    password: Option<String>,
    encryption: EncryptionMode,
    validation: CertificateValidation,
    tls: TlsOptions,
    connect_timeout: Duration,
}

impl ConnectionConfigBuilder {
    /// Set the control port
    ///
    /// Default: 21, or 990 for implicit FTPS
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the encryption mode
    pub fn encryption(mut self, mode: EncryptionMode) -> Self {
        self.encryption = mode;
        self
    }

    /// Set the certificate validation policy
    pub fn validation(mut self, validation: CertificateValidation) -> Self {
        self.validation = validation;
        self
    }

    /// Apply a named preset (encryption + validation)
    pub fn profile(self, profile: TlsProfile) -> Self {
        let (encryption, validation) = profile.settings();
        self.encryption(encryption).validation(validation)
    }

    /// Replace the protocol filter
    pub fn protocols(mut self, filter: ProtocolFilter) -> Self {
        self.tls.protocols = filter;
        self
    }

    /// Set the cipher-suite policy
    pub fn security_profile(mut self, profile: SecurityProfile) -> Self {
        self.tls.security_profile = profile;
        self
    }

    /// Set the TLS handshake timeout
    ///
    /// Default: 5 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls.handshake_timeout = timeout;
        self
    }

    /// Use a custom CA bundle instead of the system roots
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    /// Add a CRL file for revocation checking
    pub fn crl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.crl_paths.push(path.into());
        self
    }

    /// Set the TCP connect and reply timeout
    ///
    /// Default: 15 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the host is empty
    /// - the protocol filter leaves no supported TLS version (encrypted modes)
    /// - revocation checking is requested without any CRL file
    pub fn build(self) -> Result<ConnectionConfig> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }

        if self.encryption.is_encrypted() {
            self.tls.protocols.resolve()?;

            if self.validation == CertificateValidation::StrictWithRevocation
                && self.tls.crl_paths.is_empty()
            {
                return Err(Error::Config(
                    "revocation checking requires at least one CRL file".into(),
                ));
            }
        }

        if self.tls.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake timeout must be non-zero".into()));
        }

        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be non-zero".into()));
        }

        Ok(ConnectionConfig {
            port: self.port.unwrap_or_else(|| self.encryption.default_port()),
            host: self.host,
            user: self.user,
            password: self.password,
            encryption: self.encryption,
            validation: self.validation,
            tls: self.tls,
            connect_timeout: self.connect_timeout,
        })
    }
}

/// Named encryption + validation presets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsProfile {
    /// Plain FTP
    Plain,
    /// Explicit FTPS, strict validation
    #[default]
    ExplicitStrict,
    /// Explicit FTPS, any certificate accepted
    ExplicitPermissive,
    /// Explicit FTPS, strict validation plus CRL checks
    ExplicitRevocation,
    /// Implicit FTPS, strict validation
    ImplicitStrict,
    /// Implicit FTPS, any certificate accepted
    ImplicitPermissive,
}

impl TlsProfile {
    /// Encryption mode and validation policy for this preset
    pub fn settings(&self) -> (EncryptionMode, CertificateValidation) {
        match self {
            Self::Plain => (EncryptionMode::None, CertificateValidation::Strict),
            Self::ExplicitStrict => (EncryptionMode::Explicit, CertificateValidation::Strict),
            Self::ExplicitPermissive => {
                (EncryptionMode::Explicit, CertificateValidation::AcceptAny)
            }
            Self::ExplicitRevocation => (
                EncryptionMode::Explicit,
                CertificateValidation::StrictWithRevocation,
            ),
            Self::ImplicitStrict => (EncryptionMode::Implicit, CertificateValidation::Strict),
            Self::ImplicitPermissive => {
                (EncryptionMode::Implicit, CertificateValidation::AcceptAny)
            }
        }
    }
}

impl std::fmt::Display for TlsProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::ExplicitStrict => write!(f, "explicit-strict"),
            Self::ExplicitPermissive => write!(f, "explicit-permissive"),
            Self::ExplicitRevocation => write!(f, "explicit-revocation"),
            Self::ImplicitStrict => write!(f, "implicit-strict"),
            Self::ImplicitPermissive => write!(f, "implicit-permissive"),
        }
    }
}

impl std::str::FromStr for TlsProfile {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "explicit-strict" => Ok(Self::ExplicitStrict),
            "explicit-permissive" => Ok(Self::ExplicitPermissive),
            "explicit-revocation" => Ok(Self::ExplicitRevocation),
            "implicit-strict" => Ok(Self::ImplicitStrict),
            "implicit-permissive" => Ok(Self::ImplicitPermissive),
            _ => Err(Error::Config(format!(
                "invalid TLS profile '{}': expected plain, explicit-strict, explicit-permissive, \
                 explicit-revocation, implicit-strict, or implicit-permissive",
                s
            ))),
        }
    }
}
