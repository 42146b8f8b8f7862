//! conn-churn: connection-churn memory-leak harness
//!
//! Repeatedly creates, configures, connects and releases short-lived client
//! connections, once on a blocking thread and once as concurrent tasks, and
//! brackets each batch with memory samples taken around a forced reclamation
//! pass. Teardown regressions (sockets, buffers or TLS contexts that outlive
//! `release`) show up as post-reclamation growth between the two phases.
//!
//! The harness only sees the [`factory::ConnectionFactory`] capability. The
//! crate ships two implementations: [`client::FtpFactory`], a minimal FTP/FTPS
//! control-channel client, and [`testing::FakeFactory`], an in-process double.
//!
//! # Example
//!
//! ```ignore
//! use conn_churn::client::FtpFactory;
//! use conn_churn::connection::{ConnectionConfig, TlsProfile};
//! use conn_churn::harness::{MemoryMetric, MemorySampler, Orchestrator, RunConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let connection = ConnectionConfig::builder("127.0.0.1", "ftptest")
//!     .password("ftptest")
//!     .profile(TlsProfile::ExplicitPermissive)
//!     .build()?;
//! let factory = Arc::new(FtpFactory::new(connection.clone())?);
//! let sampler = MemorySampler::for_metric(MemoryMetric::ResidentSet, Duration::from_millis(500))?;
//!
//! let mut orchestrator = Orchestrator::new(
//!     RunConfig::builder().target_cycles(500).build()?,
//!     factory,
//!     Arc::new(connection),
//!     sampler,
//! );
//! let report = orchestrator.run().await?;
//! if let Some(leak) = report.leak_check(8 * 1024 * 1024) {
//!     eprintln!("{}", leak);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod error;
pub mod factory;
pub mod harness;
pub mod metrics;
pub mod protocol;
pub mod testing;

pub use error::{ConnectError, Error, Result};
