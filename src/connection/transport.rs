//! Transport abstraction (plain TCP or TLS), async and blocking flavours

use super::tls::parse_server_name;
use crate::error::ConnectError;
use bytes::BytesMut;
use rustls::ClientConfig;
use std::io::{Read, Write};
use std::net::{Shutdown, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Longest a blocking read waits before checking for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Socket timeouts surface as WouldBlock on unix, TimedOut on windows
fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Read timeout for the next poll: at most [`CANCEL_POLL`], never zero
fn poll_slice(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .clamp(Duration::from_millis(1), CANCEL_POLL)
}

/// Async transport for the concurrent execution path
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl Transport {
    /// Connect via plain TCP
    pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectError::Timeout {
                stage: "connect",
                timeout,
            })??;
        Ok(Transport::Plain(stream))
    }

    /// Connect via TLS from the first byte (implicit FTPS)
    pub async fn connect_tls(
        host: &str,
        port: u16,
        timeout: Duration,
        client_config: Arc<ClientConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        Self::connect_tcp(host, port, timeout)
            .await?
            .upgrade_to_tls(client_config, host, handshake_timeout)
            .await
    }

    /// Upgrade a plain transport to TLS (after `AUTH TLS`, or right away for implicit FTPS).
    ///
    /// Consumes `self` and returns a new `Transport` with a TLS-encrypted stream.
    pub async fn upgrade_to_tls(
        self,
        client_config: Arc<ClientConfig>,
        hostname: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        match self {
            Transport::Plain(tcp_stream) => {
                let server_name = parse_server_name(hostname)?;
                let connector = tokio_rustls::TlsConnector::from(client_config);
                let tls_stream =
                    tokio::time::timeout(handshake_timeout, connector.connect(server_name, tcp_stream))
                        .await
                        .map_err(|_| ConnectError::Timeout {
                            stage: "handshake",
                            timeout: handshake_timeout,
                        })?
                        .map_err(|e| ConnectError::Tls(format!("TLS handshake failed: {}", e)))?;

                Ok(Transport::Tls(Box::new(tls_stream)))
            }
            Transport::Tls(_) => Err(ConnectError::Tls(
                "transport is already TLS-encrypted".into(),
            )),
        }
    }

    /// Write all bytes to the transport
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectError> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush the transport
    pub async fn flush(&mut self) -> Result<(), ConnectError> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read bytes into buffer
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectError> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Whether the stream is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Shutdown the transport (sends TLS close_notify first when encrypted)
    pub async fn shutdown(&mut self) -> Result<(), ConnectError> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }
}

/// Blocking transport for the synchronous execution path
#[allow(clippy::large_enum_variant)]
pub enum BlockingTransport {
    /// Plain TCP connection
    Plain(std::net::TcpStream),
    /// TLS-encrypted TCP connection
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream>>),
}

impl std::fmt::Debug for BlockingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockingTransport::Plain(_) => f.write_str("BlockingTransport::Plain(TcpStream)"),
            BlockingTransport::Tls(_) => f.write_str("BlockingTransport::Tls(StreamOwned)"),
        }
    }
}

impl BlockingTransport {
    /// Connect via plain TCP.
    ///
    /// `timeout` bounds the TCP connect and every later write. Reads are
    /// bounded per call by [`Self::read_buf_until`].
    pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let mut last_err = None;
        let mut connected = None;
        for addr in (host, port).to_socket_addrs()? {
            match std::net::TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (connected, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(ConnectError::Timeout {
                    stage: "connect",
                    timeout,
                })
            }
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses resolved for {}", host),
                )))
            }
        };

        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(BlockingTransport::Plain(stream))
    }

    /// Connect via TLS from the first byte (implicit FTPS)
    pub fn connect_tls(
        host: &str,
        port: u16,
        timeout: Duration,
        client_config: Arc<ClientConfig>,
        handshake_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectError> {
        Self::connect_tcp(host, port, timeout)?.upgrade_to_tls(
            client_config,
            host,
            handshake_timeout,
            cancel,
        )
    }

    /// Upgrade a plain transport to TLS, completing the handshake before returning.
    ///
    /// Gives up with [`ConnectError::Cancelled`] once `cancel` fires.
    pub fn upgrade_to_tls(
        self,
        client_config: Arc<ClientConfig>,
        hostname: &str,
        handshake_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectError> {
        match self {
            BlockingTransport::Plain(mut sock) => {
                let server_name = parse_server_name(hostname)?;
                let mut conn = rustls::ClientConnection::new(client_config, server_name)
                    .map_err(|e| ConnectError::Tls(format!("TLS setup failed: {}", e)))?;

                let previous_write = sock.write_timeout()?;
                sock.set_write_timeout(Some(handshake_timeout))?;
                let deadline = Instant::now() + handshake_timeout;

                while conn.is_handshaking() {
                    sock.set_read_timeout(Some(poll_slice(deadline)))?;
                    match conn.complete_io(&mut sock) {
                        Ok(_) => {}
                        Err(e) if is_timeout(&e) => {
                            if cancel.is_cancelled() {
                                return Err(ConnectError::Cancelled);
                            }
                            if Instant::now() >= deadline {
                                return Err(ConnectError::Timeout {
                                    stage: "handshake",
                                    timeout: handshake_timeout,
                                });
                            }
                        }
                        Err(e) => {
                            return Err(ConnectError::Tls(format!("TLS handshake failed: {}", e)))
                        }
                    }
                }

                sock.set_write_timeout(previous_write)?;

                Ok(BlockingTransport::Tls(Box::new(rustls::StreamOwned::new(
                    conn, sock,
                ))))
            }
            BlockingTransport::Tls(_) => Err(ConnectError::Tls(
                "transport is already TLS-encrypted".into(),
            )),
        }
    }

    /// Write all bytes to the transport
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectError> {
        match self {
            BlockingTransport::Plain(stream) => stream.write_all(buf)?,
            BlockingTransport::Tls(stream) => stream.write_all(buf)?,
        }
        Ok(())
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<(), ConnectError> {
        match self {
            BlockingTransport::Plain(stream) => stream.flush()?,
            BlockingTransport::Tls(stream) => stream.flush()?,
        }
        Ok(())
    }

    /// Read available bytes and append them to the buffer
    pub fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, ConnectError> {
        let mut chunk = [0u8; 4096];
        let n = match self {
            BlockingTransport::Plain(stream) => stream.read(&mut chunk)?,
            BlockingTransport::Tls(stream) => stream.read(&mut chunk)?,
        };
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read like [`Self::read_buf`], waiting no later than `deadline`.
    ///
    /// Returns `Ok(None)` once the deadline passes and
    /// [`ConnectError::Cancelled`] once `cancel` fires.
    pub fn read_buf_until(
        &mut self,
        buf: &mut BytesMut,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, ConnectError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.set_read_timeout(Some(poll_slice(deadline)))?;
            match self.read_buf(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(ConnectError::Io(e)) if is_timeout(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the stream is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, BlockingTransport::Tls(_))
    }

    /// Replace the socket read timeout
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ConnectError> {
        match self {
            BlockingTransport::Plain(stream) => stream.set_read_timeout(timeout)?,
            BlockingTransport::Tls(stream) => stream.sock.set_read_timeout(timeout)?,
        }
        Ok(())
    }

    /// Shutdown the transport (sends TLS close_notify first when encrypted)
    pub fn shutdown(&mut self) -> Result<(), ConnectError> {
        match self {
            BlockingTransport::Plain(stream) => stream.shutdown(Shutdown::Both)?,
            BlockingTransport::Tls(stream) => {
                stream.conn.send_close_notify();
                // Peer may already be gone; the socket is closed regardless
                let _ = stream.conn.complete_io(&mut stream.sock);
                stream.sock.shutdown(Shutdown::Both)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, TlsConfig, TlsProfile};

    /// Accepts connections and holds them open without sending anything
    fn silent_listener() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        port
    }

    fn permissive_client_config() -> Arc<ClientConfig> {
        let config = ConnectionConfig::builder("localhost", "ftptest")
            .profile(TlsProfile::ExplicitPermissive)
            .build()
            .unwrap();
        TlsConfig::new(&config).unwrap().client_config().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Transport::connect_tcp("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
    }

    #[test]
    fn test_blocking_tcp_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = BlockingTransport::connect_tcp("127.0.0.1", port, Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 hello\r\n").await.unwrap();
        });

        let mut transport = Transport::connect_tcp("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!transport.is_tls());

        let mut buf = BytesMut::new();
        while !buf.ends_with(b"\r\n") {
            let n = transport.read_buf(&mut buf).await.unwrap();
            assert!(n > 0);
        }
        assert_eq!(&buf[..], b"220 hello\r\n");

        server.await.unwrap();
    }

    #[test]
    fn test_poll_slice_bounds() {
        assert_eq!(poll_slice(Instant::now()), Duration::from_millis(1));
        assert_eq!(
            poll_slice(Instant::now() + Duration::from_secs(60)),
            CANCEL_POLL
        );
    }

    #[test]
    fn test_blocking_read_stops_at_deadline() {
        let port = silent_listener();
        let mut transport =
            BlockingTransport::connect_tcp("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        let mut buf = BytesMut::new();
        let read = transport
            .read_buf_until(
                &mut buf,
                started + Duration::from_millis(200),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(read.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_blocking_read_stops_on_cancel() {
        let port = silent_listener();
        let mut transport =
            BlockingTransport::connect_tcp("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let mut buf = BytesMut::new();
        let result = transport.read_buf_until(&mut buf, started + Duration::from_secs(60), &cancel);
        assert!(matches!(result, Err(ConnectError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_blocking_handshake_times_out_on_silent_peer() {
        let port = silent_listener();
        let transport =
            BlockingTransport::connect_tcp("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let result = transport.upgrade_to_tls(
            permissive_client_config(),
            "localhost",
            Duration::from_millis(200),
            &CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(ConnectError::Timeout {
                stage: "handshake",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_async_handshake_times_out_on_silent_peer() {
        let port = silent_listener();
        let transport = Transport::connect_tcp("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();

        let result = transport
            .upgrade_to_tls(
                permissive_client_config(),
                "localhost",
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(
            result,
            Err(ConnectError::Timeout {
                stage: "handshake",
                ..
            })
        ));
    }
}
