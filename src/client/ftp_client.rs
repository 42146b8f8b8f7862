//! FTP/FTPS client handles
//!
//! [`FtpFactory`] produces one handle per cycle. A handle carries its own TLS
//! context, control socket and read buffer; `release` closes and drops all of
//! them. Async handles serve the concurrent path, blocking handles the sync
//! path.

use super::negotiation::{Negotiation, Step};
use crate::connection::{
    BlockingTransport, ConnectionConfig, EncryptionMode, SessionState, TlsConfig, Transport,
};
use crate::error::ConnectError;
use crate::factory::{AsyncConnection, BlockingConnection, ConnectionFactory};
use crate::protocol::constants::codes;
use crate::protocol::{decode_reply, encode_command, Command, Reply};
use crate::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rustls::ClientConfig;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Upper limit for the server's answer to `QUIT`
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_CAPACITY: usize = 1024;

/// Factory for FTP/FTPS control connections
///
/// Root certificates and CRLs are loaded once here. Each handle still builds
/// its own rustls context when configured.
///
/// # Examples
///
/// ```ignore
/// let config = ConnectionConfig::builder("127.0.0.1", "ftptest")
///     .password("ftptest")
///     .profile(TlsProfile::ExplicitPermissive)
///     .build()?;
/// let factory = FtpFactory::new(config)?;
/// ```
pub struct FtpFactory {
    config: Arc<ConnectionConfig>,
    tls: Option<TlsConfig>,
    next_id: AtomicU64,
}

impl FtpFactory {
    /// Create a factory, loading TLS material when the target is encrypted
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let tls = if config.encryption.is_encrypted() {
            Some(TlsConfig::new(&config)?)
        } else {
            None
        };

        tracing::debug!(
            address = %config.address(),
            encryption = %config.encryption,
            "ftp factory ready"
        );

        Ok(Self {
            config: Arc::new(config),
            tls,
            next_id: AtomicU64::new(1),
        })
    }

    /// Connection settings
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn handle_parts(&self, config: &ConnectionConfig) -> (u64, Arc<ConnectionConfig>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let config = if *config == *self.config {
            self.config.clone()
        } else {
            Arc::new(config.clone())
        };
        (id, config)
    }
}

impl ConnectionFactory for FtpFactory {
    type Blocking = BlockingFtpConnection;
    type Async = AsyncFtpConnection;

    fn create_blocking(&self, config: &ConnectionConfig) -> BlockingFtpConnection {
        let (id, config) = self.handle_parts(config);
        BlockingFtpConnection {
            id,
            config,
            tls: self.tls.clone(),
            context: TlsContext::Unconfigured,
            channel: None,
            state: SessionState::Initial,
        }
    }

    fn create_async(&self, config: &ConnectionConfig) -> AsyncFtpConnection {
        let (id, config) = self.handle_parts(config);
        AsyncFtpConnection {
            id,
            config,
            tls: self.tls.clone(),
            context: TlsContext::Unconfigured,
            channel: None,
            state: SessionState::Initial,
        }
    }
}

/// Per-handle TLS context, built by `configure`
enum TlsContext {
    Unconfigured,
    Plain,
    Ready(Arc<ClientConfig>),
    Failed(ConnectError),
}

impl TlsContext {
    fn build(config: &ConnectionConfig, tls: Option<&TlsConfig>) -> Self {
        if !config.encryption.is_encrypted() {
            return TlsContext::Plain;
        }
        match tls {
            Some(tls) => match tls.client_config() {
                Ok(client_config) => TlsContext::Ready(client_config),
                Err(e) => TlsContext::Failed(e),
            },
            None => TlsContext::Failed(ConnectError::Tls(
                "encrypted target but no TLS material loaded".into(),
            )),
        }
    }

    /// Take the context for one connect attempt; a stored failure surfaces here
    fn take(&mut self) -> std::result::Result<Option<Arc<ClientConfig>>, ConnectError> {
        match std::mem::replace(self, TlsContext::Unconfigured) {
            TlsContext::Unconfigured => Err(ConnectError::InvalidState {
                expected: "configured".into(),
                actual: "unconfigured".into(),
            }),
            TlsContext::Plain => {
                *self = TlsContext::Plain;
                Ok(None)
            }
            TlsContext::Ready(client_config) => {
                *self = TlsContext::Ready(client_config.clone());
                Ok(Some(client_config))
            }
            TlsContext::Failed(e) => Err(e),
        }
    }
}

fn require_context(
    context: &Option<Arc<ClientConfig>>,
) -> std::result::Result<Arc<ClientConfig>, ConnectError> {
    context
        .clone()
        .ok_or_else(|| ConnectError::Tls("TLS requested on a plain connection".into()))
}

/// Pop one complete reply off the buffer, if there is one
fn try_decode(read_buf: &mut BytesMut) -> std::result::Result<Option<Reply>, ConnectError> {
    match decode_reply(read_buf) {
        Ok((reply, consumed)) => {
            read_buf.advance(consumed);
            Ok(Some(reply))
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(ConnectError::Protocol(e.to_string())),
    }
}

fn ensure_drained(read_buf: &BytesMut) -> std::result::Result<(), ConnectError> {
    // Bytes after the AUTH reply would be read as if they came over TLS
    if read_buf.is_empty() {
        Ok(())
    } else {
        Err(ConnectError::Protocol(format!(
            "{} unexpected bytes before TLS upgrade",
            read_buf.len()
        )))
    }
}

/// Async control channel
struct ControlChannel {
    transport: Option<Transport>,
    read_buf: BytesMut,
    reply_timeout: Duration,
}

impl ControlChannel {
    fn new(transport: Transport, reply_timeout: Duration) -> Self {
        Self {
            transport: Some(transport),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            reply_timeout,
        }
    }

    fn transport(&mut self) -> std::result::Result<&mut Transport, ConnectError> {
        self.transport.as_mut().ok_or(ConnectError::ConnectionClosed)
    }

    async fn send(&mut self, cmd: &Command) -> std::result::Result<(), ConnectError> {
        tracing::trace!(command = cmd.verb(), "send");
        let buf = encode_command(cmd)?;
        let transport = self.transport()?;
        transport.write_all(&buf).await?;
        transport.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> std::result::Result<Reply, ConnectError> {
        loop {
            if let Some(reply) = try_decode(&mut self.read_buf)? {
                tracing::trace!(code = reply.code, "reply");
                return Ok(reply);
            }

            let limit = self.reply_timeout;
            let transport = self.transport.as_mut().ok_or(ConnectError::ConnectionClosed)?;
            let n = tokio::time::timeout(limit, transport.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| ConnectError::Timeout {
                    stage: "reply",
                    timeout: limit,
                })??;
            if n == 0 {
                return Err(ConnectError::ConnectionClosed);
            }
        }
    }

    async fn upgrade(
        &mut self,
        client_config: Arc<ClientConfig>,
        hostname: &str,
        handshake_timeout: Duration,
    ) -> std::result::Result<(), ConnectError> {
        ensure_drained(&self.read_buf)?;
        let transport = self.transport.take().ok_or(ConnectError::ConnectionClosed)?;
        self.transport = Some(
            transport
                .upgrade_to_tls(client_config, hostname, handshake_timeout)
                .await?,
        );
        Ok(())
    }

    async fn close(mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.shutdown().await {
            tracing::debug!(error = %e, "shutdown failed");
        }
    }
}

/// Async FTP handle for the concurrent path
pub struct AsyncFtpConnection {
    id: u64,
    config: Arc<ConnectionConfig>,
    tls: Option<TlsConfig>,
    context: TlsContext,
    channel: Option<ControlChannel>,
    state: SessionState,
}

impl AsyncFtpConnection {
    /// Session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the control channel is encrypted
    pub fn is_tls(&self) -> bool {
        self.channel
            .as_ref()
            .and_then(|c| c.transport.as_ref())
            .is_some_and(Transport::is_tls)
    }

    async fn login(&mut self) -> std::result::Result<(), ConnectError> {
        let context = self.context.take()?;
        if self.channel.is_some() {
            return Err(ConnectError::InvalidState {
                expected: SessionState::Initial.to_string(),
                actual: self.state.to_string(),
            });
        }
        let config = self.config.clone();

        let transport = match config.encryption {
            EncryptionMode::Implicit => {
                Transport::connect_tls(
                    &config.host,
                    config.port,
                    config.connect_timeout,
                    require_context(&context)?,
                    config.tls.handshake_timeout,
                )
                .await?
            }
            EncryptionMode::None | EncryptionMode::Explicit => {
                Transport::connect_tcp(&config.host, config.port, config.connect_timeout).await?
            }
        };
        self.state.transition(SessionState::AwaitingGreeting)?;
        let channel = self
            .channel
            .insert(ControlChannel::new(transport, config.connect_timeout));

        let mut negotiation = Negotiation::new(&config);
        loop {
            let reply = channel.read_reply().await?;
            let step = negotiation.on_reply(&reply);
            self.state = negotiation.state();
            match step? {
                Step::Wait => continue,
                Step::Send(cmd) => channel.send(&cmd).await?,
                Step::StartTls => {
                    channel
                        .upgrade(
                            require_context(&context)?,
                            &config.host,
                            config.tls.handshake_timeout,
                        )
                        .await?;
                    tracing::debug!("control channel upgraded to TLS");
                    let cmd = negotiation.tls_established()?;
                    self.state = negotiation.state();
                    channel.send(&cmd).await?;
                }
                Step::Done => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl AsyncConnection for AsyncFtpConnection {
    fn configure(&mut self, config: &ConnectionConfig) {
        if *config != *self.config {
            self.config = Arc::new(config.clone());
        }
        self.context = TlsContext::build(&self.config, self.tls.as_ref());
    }

    async fn connect(&mut self) -> std::result::Result<(), ConnectError> {
        let span = tracing::debug_span!(
            "connect",
            handle = self.id,
            address = %self.config.address(),
            encryption = %self.config.encryption,
        );
        self.login().instrument(span).await?;
        tracing::trace!(handle = self.id, tls = self.is_tls(), "logged in");
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.transport.is_some() && self.state != SessionState::Closed {
                let limit = QUIT_TIMEOUT.min(self.config.connect_timeout);
                let quit = async {
                    channel.send(&Command::Quit).await?;
                    channel.read_reply().await
                };
                match tokio::time::timeout(limit, quit).await {
                    Ok(Ok(reply)) if reply.code == codes::CLOSING => {}
                    Ok(Ok(reply)) => tracing::debug!(handle = self.id, %reply, "unexpected QUIT reply"),
                    Ok(Err(e)) => tracing::debug!(handle = self.id, error = %e, "QUIT failed"),
                    Err(_) => tracing::debug!(handle = self.id, "QUIT timed out"),
                }
            }
            channel.close().await;
        }
        self.context = TlsContext::Unconfigured;
        self.state = SessionState::Closed;
    }
}

/// Blocking control channel
///
/// Reads poll `cancel` so a silent server cannot pin the sync worker.
struct BlockingControlChannel {
    transport: Option<BlockingTransport>,
    read_buf: BytesMut,
    reply_timeout: Duration,
    cancel: CancellationToken,
}

impl BlockingControlChannel {
    fn new(transport: BlockingTransport, reply_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            transport: Some(transport),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            reply_timeout,
            cancel,
        }
    }

    fn transport(&mut self) -> std::result::Result<&mut BlockingTransport, ConnectError> {
        self.transport.as_mut().ok_or(ConnectError::ConnectionClosed)
    }

    fn send(&mut self, cmd: &Command) -> std::result::Result<(), ConnectError> {
        tracing::trace!(command = cmd.verb(), "send");
        let buf = encode_command(cmd)?;
        let transport = self.transport()?;
        transport.write_all(&buf)?;
        transport.flush()?;
        Ok(())
    }

    fn read_reply(&mut self) -> std::result::Result<Reply, ConnectError> {
        let limit = self.reply_timeout;
        let deadline = Instant::now() + limit;
        loop {
            if let Some(reply) = try_decode(&mut self.read_buf)? {
                tracing::trace!(code = reply.code, "reply");
                return Ok(reply);
            }

            let transport = self.transport.as_mut().ok_or(ConnectError::ConnectionClosed)?;
            match transport.read_buf_until(&mut self.read_buf, deadline, &self.cancel)? {
                Some(0) => return Err(ConnectError::ConnectionClosed),
                Some(_) => {}
                None => {
                    return Err(ConnectError::Timeout {
                        stage: "reply",
                        timeout: limit,
                    })
                }
            }
        }
    }

    fn upgrade(
        &mut self,
        client_config: Arc<ClientConfig>,
        hostname: &str,
        handshake_timeout: Duration,
    ) -> std::result::Result<(), ConnectError> {
        ensure_drained(&self.read_buf)?;
        let transport = self.transport.take().ok_or(ConnectError::ConnectionClosed)?;
        self.transport = Some(transport.upgrade_to_tls(
            client_config,
            hostname,
            handshake_timeout,
            &self.cancel,
        )?);
        Ok(())
    }

    fn close(mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.shutdown() {
            tracing::debug!(error = %e, "shutdown failed");
        }
    }
}

/// Blocking FTP handle for the sync path
pub struct BlockingFtpConnection {
    id: u64,
    config: Arc<ConnectionConfig>,
    tls: Option<TlsConfig>,
    context: TlsContext,
    channel: Option<BlockingControlChannel>,
    state: SessionState,
}

impl BlockingFtpConnection {
    /// Session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the control channel is encrypted
    pub fn is_tls(&self) -> bool {
        self.channel
            .as_ref()
            .and_then(|c| c.transport.as_ref())
            .is_some_and(BlockingTransport::is_tls)
    }

    fn login(&mut self, cancel: &CancellationToken) -> std::result::Result<(), ConnectError> {
        let context = self.context.take()?;
        if self.channel.is_some() {
            return Err(ConnectError::InvalidState {
                expected: SessionState::Initial.to_string(),
                actual: self.state.to_string(),
            });
        }
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        let config = self.config.clone();

        let transport = match config.encryption {
            EncryptionMode::Implicit => BlockingTransport::connect_tls(
                &config.host,
                config.port,
                config.connect_timeout,
                require_context(&context)?,
                config.tls.handshake_timeout,
                cancel,
            )?,
            EncryptionMode::None | EncryptionMode::Explicit => {
                BlockingTransport::connect_tcp(&config.host, config.port, config.connect_timeout)?
            }
        };
        self.state.transition(SessionState::AwaitingGreeting)?;
        let channel = self.channel.insert(BlockingControlChannel::new(
            transport,
            config.connect_timeout,
            cancel.clone(),
        ));

        let mut negotiation = Negotiation::new(&config);
        loop {
            let reply = channel.read_reply()?;
            let step = negotiation.on_reply(&reply);
            self.state = negotiation.state();
            match step? {
                Step::Wait => continue,
                Step::Send(cmd) => channel.send(&cmd)?,
                Step::StartTls => {
                    channel.upgrade(
                        require_context(&context)?,
                        &config.host,
                        config.tls.handshake_timeout,
                    )?;
                    tracing::debug!("control channel upgraded to TLS");
                    let cmd = negotiation.tls_established()?;
                    self.state = negotiation.state();
                    channel.send(&cmd)?;
                }
                Step::Done => return Ok(()),
            }
        }
    }
}

impl BlockingConnection for BlockingFtpConnection {
    fn configure(&mut self, config: &ConnectionConfig) {
        if *config != *self.config {
            self.config = Arc::new(config.clone());
        }
        self.context = TlsContext::build(&self.config, self.tls.as_ref());
    }

    fn connect(&mut self) -> std::result::Result<(), ConnectError> {
        self.connect_cancellable(&CancellationToken::new())
    }

    fn connect_cancellable(
        &mut self,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ConnectError> {
        let span = tracing::debug_span!(
            "connect",
            handle = self.id,
            address = %self.config.address(),
            encryption = %self.config.encryption,
        );
        span.in_scope(|| self.login(cancel))?;
        tracing::trace!(handle = self.id, tls = self.is_tls(), "logged in");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.transport.is_some() {
                channel.reply_timeout = QUIT_TIMEOUT.min(self.config.connect_timeout);
                let quit = channel
                    .send(&Command::Quit)
                    .and_then(|_| channel.read_reply());
                match quit {
                    Ok(reply) if reply.code == codes::CLOSING => {}
                    Ok(reply) => tracing::debug!(handle = self.id, %reply, "unexpected QUIT reply"),
                    Err(e) => tracing::debug!(handle = self.id, error = %e, "QUIT failed"),
                }
            }
            channel.close();
        }
        self.context = TlsContext::Unconfigured;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TlsProfile;

    // Verify handles can move across threads and tasks
    const _SEND_SAFETY_CHECK: fn() = || {
        fn require_send<T: Send>() {}
        require_send::<AsyncFtpConnection>();
        require_send::<BlockingFtpConnection>();
    };

    fn plain_factory() -> FtpFactory {
        let config = ConnectionConfig::builder("127.0.0.1", "ftptest")
            .profile(TlsProfile::Plain)
            .port(1)
            .build()
            .unwrap();
        FtpFactory::new(config).unwrap()
    }

    #[test]
    fn test_plain_factory_loads_no_tls() {
        let factory = plain_factory();
        assert!(factory.tls.is_none());
        assert_eq!(factory.config().port, 1);
    }

    #[test]
    fn test_permissive_factory_loads_tls() {
        let config = ConnectionConfig::builder("127.0.0.1", "ftptest")
            .profile(TlsProfile::ExplicitPermissive)
            .build()
            .unwrap();
        let factory = FtpFactory::new(config).unwrap();
        assert!(factory.tls.is_some());
    }

    #[test]
    fn test_handles_get_distinct_ids() {
        let factory = plain_factory();
        let config = factory.config().clone();
        let a = factory.create_blocking(&config);
        let b = factory.create_async(&config);
        assert_ne!(a.id, b.id);
        assert!(Arc::ptr_eq(&a.config, &factory.config));
    }

    #[test]
    fn test_connect_without_configure_fails() {
        let factory = plain_factory();
        let config = factory.config().clone();
        let mut conn = factory.create_blocking(&config);
        let err = conn.connect().unwrap_err();
        assert!(matches!(err, ConnectError::InvalidState { .. }));
        conn.release();
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[test]
    fn test_missing_tls_material_surfaces_at_connect() {
        let factory = plain_factory();
        let encrypted = ConnectionConfig::builder("127.0.0.1", "ftptest")
            .profile(TlsProfile::ExplicitPermissive)
            .build()
            .unwrap();
        let mut conn = factory.create_blocking(&encrypted);
        conn.configure(&encrypted);
        assert!(matches!(conn.connect(), Err(ConnectError::Tls(_))));
    }

    #[test]
    fn test_release_is_idempotent() {
        let factory = plain_factory();
        let config = factory.config().clone();
        let mut conn = factory.create_blocking(&config);
        conn.configure(&config);
        conn.release();
        conn.release();
        assert_eq!(conn.state(), SessionState::Closed);
        assert!(!conn.is_tls());
    }

    #[test]
    fn test_try_decode_waits_for_complete_reply() {
        let mut buf = BytesMut::from(&b"220 rea"[..]);
        assert!(try_decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"dy\r\n331 next\r\n");
        let reply = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(&buf[..], b"331 next\r\n");
    }

    #[test]
    fn test_try_decode_rejects_garbage() {
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        assert!(matches!(
            try_decode(&mut buf),
            Err(ConnectError::Protocol(_))
        ));
    }

    #[test]
    fn test_pending_bytes_block_upgrade() {
        assert!(ensure_drained(&BytesMut::new()).is_ok());
        assert!(ensure_drained(&BytesMut::from(&b"230 x\r\n"[..])).is_err());
    }

    #[tokio::test]
    async fn test_async_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::builder("127.0.0.1", "ftptest")
            .profile(TlsProfile::Plain)
            .port(port)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let factory = FtpFactory::new(config.clone()).unwrap();
        let mut conn = factory.create_async(&config);
        conn.configure(&config);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Io(_)), "got {:?}", err);
        conn.release().await;
        assert_eq!(conn.state(), SessionState::Closed);
    }
}
