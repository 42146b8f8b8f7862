//! FTP/FTPS client
//!
//! The connection factory the harness churns by default: every handle opens a
//! control connection, optionally secures it, logs in and closes it again.

mod ftp_client;
mod negotiation;
mod target;

pub use ftp_client::{AsyncFtpConnection, BlockingFtpConnection, FtpFactory};
pub use negotiation::{Negotiation, Step};
pub use target::{TargetInfo, ANONYMOUS_USER};
