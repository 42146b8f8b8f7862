//! Target URL parsing
//!
//! Supports formats:
//! * ftp://[user[:password]@]host[:port] (plain)
//! * ftpes://[user[:password]@]host[:port] (explicit FTPS, `AUTH TLS`)
//! * ftps://[user[:password]@]host[:port] (implicit FTPS)
//!
//! An optional `?verify=any|strict|revocation` query parameter selects the
//! certificate validation policy.

use crate::connection::{CertificateValidation, ConnectionConfig, ConnectionConfigBuilder, EncryptionMode};
use crate::{Error, Result};

/// User sent when the URL carries no credentials
pub const ANONYMOUS_USER: &str = "anonymous";

/// Parsed target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Encryption mode implied by the scheme
    pub encryption: EncryptionMode,
    /// Host
    pub host: String,
    /// Port (scheme default if absent)
    pub port: u16,
    /// Username
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// Validation policy from the query string, if given
    pub validation: Option<CertificateValidation>,
}

/// Extract a query parameter value from a query string
fn parse_query_param(query_string: &str, param: &str) -> Option<String> {
    if query_string.is_empty() {
        return None;
    }

    // Remove leading '?' if present
    let query = query_string.trim_start_matches('?');

    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == param {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn parse_validation(value: &str) -> Result<CertificateValidation> {
    match value {
        "any" => Ok(CertificateValidation::AcceptAny),
        "strict" => Ok(CertificateValidation::Strict),
        "revocation" => Ok(CertificateValidation::StrictWithRevocation),
        _ => Err(Error::Config(format!(
            "invalid verify '{}': expected any, strict, or revocation",
            value
        ))),
    }
}

impl TargetInfo {
    /// Parse a target URL
    pub fn parse(s: &str) -> Result<Self> {
        let (encryption, rest) = if let Some(rest) = s.strip_prefix("ftpes://") {
            (EncryptionMode::Explicit, rest)
        } else if let Some(rest) = s.strip_prefix("ftps://") {
            (EncryptionMode::Implicit, rest)
        } else if let Some(rest) = s.strip_prefix("ftp://") {
            (EncryptionMode::None, rest)
        } else {
            return Err(Error::Config(
                "target must start with ftp://, ftpes://, or ftps://".into(),
            ));
        };

        // Split off query string before parsing credentials and host
        let (rest, query_string) = match rest.find('?') {
            Some(q_pos) => rest.split_at(q_pos),
            None => (rest, ""),
        };

        // Paths carry no meaning for a control-channel probe
        let rest = rest.split('/').next().unwrap_or("");

        // Credentials may contain '@'; the host starts after the last one
        let (auth, host_port) = match rest.rfind('@') {
            Some(pos) => (Some(&rest[..pos]), &rest[pos + 1..]),
            None => (None, rest),
        };

        let (user, password) = match auth {
            Some(auth) => match auth.split_once(':') {
                Some((user, pass)) => (user.to_string(), Some(pass.to_string())),
                None => (auth.to_string(), None),
            },
            None => (ANONYMOUS_USER.to_string(), None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port '{}'", port)))?;
                (host.to_string(), port)
            }
            _ => (host_port.to_string(), encryption.default_port()),
        };

        if host.is_empty() {
            return Err(Error::Config("target is missing a host".into()));
        }

        let validation = parse_query_param(query_string, "verify")
            .map(|v| parse_validation(&v))
            .transpose()?;

        Ok(Self {
            encryption,
            host,
            port,
            user,
            password,
            validation,
        })
    }

    /// Convert to a `ConnectionConfigBuilder` for further options
    pub fn to_builder(&self) -> ConnectionConfigBuilder {
        let mut builder = ConnectionConfig::builder(&self.host, &self.user)
            .port(self.port)
            .encryption(self.encryption);
        if let Some(ref password) = self.password {
            builder = builder.password(password);
        }
        if let Some(validation) = self.validation {
            builder = builder.validation(validation);
        }
        builder
    }
}
