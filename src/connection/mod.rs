//! Connection management
//!
//! This module handles:
//! * Connection settings and named TLS profiles
//! * Transport abstraction (plain TCP vs TLS, async vs blocking)
//! * Control-session state machine enforcement
//! * rustls context construction

mod config;
mod state;
mod tls;
mod transport;

pub use config::{
    CertificateValidation, ConnectionConfig, ConnectionConfigBuilder, EncryptionMode,
    ProtocolFilter, SecurityProfile, TlsOptions, TlsProfile, TlsVersion,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use state::SessionState;
pub use tls::{parse_server_name, TlsConfig};
pub use transport::{BlockingTransport, Transport};
