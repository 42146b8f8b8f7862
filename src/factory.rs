//! Connection factory capability
//!
//! The harness never talks to a client library directly. It asks a
//! [`ConnectionFactory`] for a handle, configures it, connects it and releases
//! it. Any client that implements these traits can be churned.
//!
//! Release is guaranteed by the lease types: a [`Lease`] releases its handle
//! on drop, and an [`AsyncLease`] that is dropped unreleased (for example
//! because its future was cancelled) hands the release to the runtime.

use crate::connection::ConnectionConfig;
use crate::error::ConnectError;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use tokio_util::sync::CancellationToken;

/// Handle used on the blocking (sync) execution path
pub trait BlockingConnection: Send {
    /// Apply connection settings before connecting
    fn configure(&mut self, config: &ConnectionConfig);

    /// Open, secure and authenticate the connection
    fn connect(&mut self) -> Result<(), ConnectError>;

    /// Connect, giving up with [`ConnectError::Cancelled`] once `cancel` fires.
    ///
    /// The default ignores the token; clients that can block on the network
    /// should override it.
    fn connect_cancellable(&mut self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let _ = cancel;
        self.connect()
    }

    /// Close the connection and free everything it holds.
    ///
    /// Must be idempotent.
    fn release(&mut self);
}

/// Handle used on the concurrent (async) execution path
#[async_trait]
pub trait AsyncConnection: Send {
    /// Apply connection settings before connecting
    fn configure(&mut self, config: &ConnectionConfig);

    /// Open, secure and authenticate the connection
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Close the connection and free everything it holds.
    ///
    /// Must be idempotent.
    async fn release(&mut self);
}

/// Produces connection handles
///
/// A factory owns configuration only; every handle it creates belongs to the
/// caller.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Blocking handle type
    type Blocking: BlockingConnection + 'static;
    /// Async handle type
    type Async: AsyncConnection + 'static;

    /// Create a blocking handle
    fn create_blocking(&self, config: &ConnectionConfig) -> Self::Blocking;

    /// Create an async handle
    fn create_async(&self, config: &ConnectionConfig) -> Self::Async;
}

/// Scoped ownership of a blocking handle; released exactly once
pub struct Lease<C: BlockingConnection> {
    conn: C,
    released: bool,
}

impl<C: BlockingConnection> Lease<C> {
    /// Take ownership of a handle
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            released: false,
        }
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.conn.release();
        }
    }
}

impl<C: BlockingConnection> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: BlockingConnection> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: BlockingConnection> Drop for Lease<C> {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Scoped ownership of an async handle; released exactly once
pub struct AsyncLease<C: AsyncConnection + 'static> {
    conn: Option<C>,
}

impl<C: AsyncConnection + 'static> AsyncLease<C> {
    /// Take ownership of a handle
    pub fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    /// Apply connection settings
    pub fn configure(&mut self, config: &ConnectionConfig) {
        if let Some(conn) = self.conn.as_mut() {
            conn.configure(config);
        }
    }

    /// Connect the leased handle
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        match self.conn.as_mut() {
            Some(conn) => conn.connect().await,
            None => Err(ConnectError::InvalidState {
                expected: "leased handle".into(),
                actual: "released".into(),
            }),
        }
    }

    /// Release the handle and wait for it to close
    pub async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.release().await;
        }
    }
}

impl<C: AsyncConnection + 'static> Drop for AsyncLease<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("async lease dropped unreleased, releasing on runtime");
                handle.spawn(async move {
                    conn.release().await;
                });
            }
            Err(_) => {
                tracing::warn!("async lease dropped outside a runtime; handle dropped without release");
            }
        }
    }
}
