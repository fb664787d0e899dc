//! Tunnel client.
//!
//! Owns the single QUIC connection to the server, authenticates it on the
//! first bidirectional stream and then hands out one QUIC stream per
//! proxied TCP connection and one datagram session per UDP flow group.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::common::{build_tls_config, resolve_server_address, DnsResolver, TlsOptions};
use crate::congestion::{bps_to_bytes, BandwidthHandle, Brutal, CongestionFactory};
use crate::datagram::{dispatch, SessionTable, UdpSession};
use crate::error::{Error, Result};
use crate::obfs::Obfuscator;
use crate::protocol::{
    read_frame, write_frame, Frame, ProtocolError, DEFAULT_ALPN, PROTOCOL_VERSION,
};
use crate::transport::{bind_endpoint, unspecified_for, TransportOptions};

/// Application close code sent when the client shuts the session down.
const CLOSE_CODE_NORMAL: u32 = 0;
/// Application close code sent after the server rejected our credentials.
const CLOSE_CODE_AUTH_REJECTED: u32 = 0x101;
/// Stream reset code for a rejected connect request.
const RESET_CODE_CONNECT_FAILED: u32 = 0x102;

/// Everything needed to establish a session.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub server: String,
    pub auth: Bytes,
    /// Claimed upload bandwidth in bits per second.
    pub up_bps: u64,
    /// Claimed download bandwidth in bits per second.
    pub down_bps: u64,
    pub tls: TlsOptions,
    pub transport: TransportOptions,
    pub obfuscator: Option<Arc<dyn Obfuscator>>,
    pub congestion: Arc<dyn CongestionFactory>,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, auth: impl Into<Bytes>) -> Self {
        Self {
            server: server.into(),
            auth: auth.into(),
            up_bps: 0,
            down_bps: 0,
            tls: TlsOptions {
                alpn: DEFAULT_ALPN.to_string(),
                ..TlsOptions::default()
            },
            transport: TransportOptions::default(),
            obfuscator: None,
            congestion: Arc::new(Brutal),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("up_bps", &self.up_bps)
            .field("down_bps", &self.down_bps)
            .field("tls", &self.tls)
            .field("transport", &self.transport)
            .field("obfuscated", &self.obfuscator.is_some())
            .finish_non_exhaustive()
    }
}

/// Bandwidth the server advertised in its `AuthAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerBandwidth {
    /// Rate the server will send to us, bits per second (0 = unlimited).
    pub up_bps: u64,
    /// Rate the server accepts from us, bits per second (0 = unlimited).
    pub down_bps: u64,
}

/// Reference send rate in bits per second after the auth exchange.
///
/// The server's receive limit wins when it set one; otherwise we keep the
/// rate we claimed.
pub fn negotiated_send_bps(claimed_up_bps: u64, server: ServerBandwidth) -> u64 {
    if server.down_bps != 0 {
        server.down_bps
    } else {
        claimed_up_bps
    }
}

struct Inner {
    endpoint: Endpoint,
    connection: Connection,
    bandwidth: BandwidthHandle,
    server_bandwidth: ServerBandwidth,
    sessions: Arc<SessionTable>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connection
            .close(VarInt::from_u32(CLOSE_CODE_NORMAL), b"client dropped");
    }
}

/// Authenticated session to a tunnel server.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("remote", &self.inner.connection.remote_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Connects to the server and authenticates.
    ///
    /// Fails with [`Error::Auth`] when the server rejects the token, in which
    /// case the connection is closed before returning.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let resolver = DnsResolver::new();
        let (server_addr, server_name) =
            resolve_server_address(&config.server, config.tls.sni.as_deref(), &resolver).await?;

        let tls_config = build_tls_config(&config.tls)?;
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| Error::Config(format!("failed to create QUIC config: {}", e)))?;

        // Seeded with our own claim; replaced by the negotiated rate below.
        let bandwidth = BandwidthHandle::new(bps_to_bytes(config.up_bps));
        let transport = config
            .transport
            .build(Some(config.congestion.controller_factory(bandwidth.clone())))?;

        let mut quic_config = quinn::ClientConfig::new(Arc::new(crypto));
        quic_config.transport_config(Arc::new(transport));

        let endpoint = bind_endpoint(
            unspecified_for(&server_addr),
            config.obfuscator.clone(),
            None,
        )?;

        tracing::debug!(%server_addr, %server_name, "connecting");
        let connection = endpoint
            .connect_with(quic_config, server_addr, &server_name)
            .map_err(|e| Error::Network(format!("failed to connect to {}: {}", server_addr, e)))?
            .await
            .map_err(connection_error)?;

        let server_bandwidth = match authenticate(&connection, &config).await {
            Ok(bw) => bw,
            Err(e) => {
                let code = match e {
                    Error::Auth(_) => CLOSE_CODE_AUTH_REJECTED,
                    _ => CLOSE_CODE_NORMAL,
                };
                connection.close(VarInt::from_u32(code), b"handshake failed");
                endpoint.close(VarInt::from_u32(code), b"handshake failed");
                return Err(e);
            }
        };

        let send_bps = negotiated_send_bps(config.up_bps, server_bandwidth);
        bandwidth.set(bps_to_bytes(send_bps));
        tracing::debug!(
            send_bps,
            server_up_bps = server_bandwidth.up_bps,
            server_down_bps = server_bandwidth.down_bps,
            "authenticated"
        );

        let sessions = Arc::new(SessionTable::new());
        tokio::spawn(dispatch(connection.clone(), Arc::clone(&sessions)));

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                connection,
                bandwidth,
                server_bandwidth,
                sessions,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Opens a stream to `addr` (host:port) through the tunnel.
    pub async fn dial_tcp(&self, addr: &str) -> Result<TunnelStream> {
        self.open_stream(addr, None).await
    }

    /// Opens a stream to `addr`, giving up with [`Error::DeadlineExceeded`] at `deadline`.
    ///
    /// Closing the client resolves a pending call with [`Error::Closed`].
    pub async fn open_stream(&self, addr: &str, deadline: Option<Instant>) -> Result<TunnelStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let dial = async {
            tokio::select! {
                result = self.dial(addr) => result,
                _ = self.inner.connection.closed() => Err(Error::Closed),
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, dial)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => dial.await,
        }
    }

    async fn dial(&self, addr: &str) -> Result<TunnelStream> {
        let (mut send, mut recv) = self
            .inner
            .connection
            .open_bi()
            .await
            .map_err(|e| self.session_error(e))?;

        write_frame(
            &mut send,
            &Frame::ConnectRequest {
                addr: addr.to_string(),
            },
        )
        .await
        .map_err(|e| self.stream_error(e))?;

        match read_frame(&mut recv).await.map_err(|e| self.stream_error(e))? {
            Some(Frame::ConnectResponse { ok: true, .. }) => {
                tracing::trace!(addr, stream = %send.id(), "stream established");
                Ok(TunnelStream::new(addr.to_string(), send, recv))
            }
            Some(Frame::ConnectResponse { ok: false, message }) => {
                let _ = send.reset(VarInt::from_u32(RESET_CODE_CONNECT_FAILED));
                Err(Error::ConnectFailed {
                    addr: addr.to_string(),
                    message,
                })
            }
            Some(other) => Err(Error::Protocol(ProtocolError::UnexpectedFrame {
                expected: "CONNECT_RESP",
                got: other.name(),
            })),
            None => Err(Error::ConnectFailed {
                addr: addr.to_string(),
                message: "stream closed by server".to_string(),
            }),
        }
    }

    /// Allocates a datagram session on the server.
    pub async fn listen_udp(&self) -> Result<UdpSession> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.inner.connection.max_datagram_size().is_none() {
            return Err(Error::DatagramUnsupported(
                "server does not accept datagrams".to_string(),
            ));
        }

        let request = async {
            let (mut send, mut recv) = self
                .inner
                .connection
                .open_bi()
                .await
                .map_err(|e| self.session_error(e))?;
            write_frame(&mut send, &Frame::UdpRequest)
                .await
                .map_err(|e| self.stream_error(e))?;

            match read_frame(&mut recv).await.map_err(|e| self.stream_error(e))? {
                Some(Frame::UdpResponse {
                    ok: true,
                    session_id,
                    ..
                }) => {
                    let inbound = self.inner.sessions.register(session_id)?;
                    tracing::debug!(session_id, "datagram session opened");
                    Ok(UdpSession::new(
                        session_id,
                        self.inner.connection.clone(),
                        Arc::clone(&self.inner.sessions),
                        inbound,
                        (send, recv),
                    ))
                }
                Some(Frame::UdpResponse { ok: false, message, .. }) => {
                    Err(Error::DatagramUnsupported(message))
                }
                Some(other) => Err(Error::Protocol(ProtocolError::UnexpectedFrame {
                    expected: "UDP_RESP",
                    got: other.name(),
                })),
                None => Err(Error::DatagramUnsupported(
                    "stream closed by server".to_string(),
                )),
            }
        };

        tokio::select! {
            result = request => result,
            _ = self.inner.connection.closed() => Err(Error::Closed),
        }
    }

    /// Closes the session and everything opened on it. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .connection
            .close(VarInt::from_u32(CLOSE_CODE_NORMAL), b"client closed");
        self.inner.sessions.close_all();
        self.inner
            .endpoint
            .close(VarInt::from_u32(CLOSE_CODE_NORMAL), b"client closed");
        tracing::debug!("session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.connection.close_reason().is_some()
    }

    /// Resolves when the session ends, for whatever reason.
    pub async fn closed(&self) -> Error {
        match self.inner.connection.closed().await {
            ConnectionError::LocallyClosed => Error::Closed,
            e => Error::Network(format!("connection lost: {}", e)),
        }
    }

    /// Bandwidth advertised by the server.
    pub fn server_bandwidth(&self) -> ServerBandwidth {
        self.inner.server_bandwidth
    }

    /// Reference rate the congestion controller paces at, bytes per second.
    pub fn send_rate(&self) -> u64 {
        self.inner.bandwidth.get()
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.inner.connection.remote_address()
    }

    fn session_error(&self, e: ConnectionError) -> Error {
        if self.is_closed() {
            Error::Closed
        } else {
            Error::Network(e.to_string())
        }
    }

    fn stream_error(&self, e: io::Error) -> Error {
        if self.is_closed() {
            Error::Closed
        } else {
            Error::Io(e)
        }
    }
}

/// Runs the auth exchange on the first bidirectional stream.
async fn authenticate(connection: &Connection, config: &ClientConfig) -> Result<ServerBandwidth> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(handshake_error)?;
    write_frame(
        &mut send,
        &Frame::Auth {
            version: PROTOCOL_VERSION,
            up_bps: config.up_bps,
            down_bps: config.down_bps,
            token: config.auth.clone(),
        },
    )
    .await
    .map_err(handshake_error)?;

    let ack = read_frame(&mut recv).await.map_err(handshake_error)?;
    let _ = send.finish();

    match ack {
        Some(Frame::AuthAck {
            accepted: true,
            up_bps,
            down_bps,
            ..
        }) => Ok(ServerBandwidth { up_bps, down_bps }),
        Some(Frame::AuthAck {
            accepted: false,
            message,
            ..
        }) => Err(Error::Auth(if message.is_empty() {
            "rejected by server".to_string()
        } else {
            message
        })),
        Some(other) => Err(Error::Handshake(
            ProtocolError::UnexpectedFrame {
                expected: "AUTH_ACK",
                got: other.name(),
            }
            .to_string(),
        )),
        None => Err(Error::Handshake(
            "control stream closed before AUTH_ACK".to_string(),
        )),
    }
}

fn handshake_error(e: impl std::fmt::Display) -> Error {
    Error::Handshake(e.to_string())
}

fn connection_error(e: ConnectionError) -> Error {
    match &e {
        // Crypto errors occupy 0x100..=0x1ff (TLS alert + 0x100).
        ConnectionError::TransportError(t) if (0x100..0x200).contains(&u64::from(t.code)) => {
            Error::TlsVerificationFailed(e.to_string())
        }
        ConnectionError::TimedOut => Error::Network(e.to_string()),
        _ => Error::Handshake(e.to_string()),
    }
}

/// Byte stream to one remote destination.
#[derive(Debug)]
pub struct TunnelStream {
    destination: String,
    send: SendStream,
    recv: RecvStream,
    bytes_sent: u64,
    bytes_received: u64,
}

impl TunnelStream {
    fn new(destination: String, send: SendStream, recv: RecvStream) -> Self {
        Self {
            destination,
            send,
            recv,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Destination this stream was opened to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Aborts the stream in both directions.
    pub fn abort(&mut self) {
        let _ = self.send.reset(VarInt::from_u32(CLOSE_CODE_NORMAL));
        let _ = self.recv.stop(VarInt::from_u32(CLOSE_CODE_NORMAL));
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf);
        if let Poll::Ready(Ok(())) = result {
            self.bytes_received += (buf.filled().len() - before) as u64;
        }
        result
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.bytes_sent += n as u64;
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_limit_wins() {
        let server = ServerBandwidth {
            up_bps: 0,
            down_bps: 50_000_000,
        };
        assert_eq!(negotiated_send_bps(100_000_000, server), 50_000_000);
    }

    #[test]
    fn test_claim_kept_without_server_limit() {
        let server = ServerBandwidth {
            up_bps: 0,
            down_bps: 0,
        };
        assert_eq!(negotiated_send_bps(100_000_000, server), 100_000_000);
    }

    #[test]
    fn test_tunnel_stream_is_tokio_io() {
        fn assert_io<T: AsyncRead + AsyncWrite + Unpin + Send + 'static>() {}
        assert_io::<TunnelStream>();
    }

    #[test]
    fn test_config_debug_hides_token() {
        let config = ClientConfig::new("example.com:443", Bytes::from_static(b"hunter2"));
        let debug = format!("{:?}", config);
        assert!(debug.contains("example.com:443"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_connection_error_mapping() {
        assert!(matches!(
            connection_error(ConnectionError::TimedOut),
            Error::Network(_)
        ));
        assert!(matches!(
            connection_error(ConnectionError::LocallyClosed),
            Error::Handshake(_)
        ));
    }
}
