//! QUIC endpoint construction.
//!
//! Wraps the endpoint's UDP socket so that every packet passes through the
//! configured [`Obfuscator`], and builds the quinn transport configuration
//! (receive windows, keep-alive, datagrams, congestion control).

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, Runtime, TokioRuntime, UdpPoller, VarInt};
use quinn_udp::{RecvMeta, Transmit};

use crate::error::{Error, Result};
use crate::obfs::Obfuscator;

/// Default per-stream receive window (15 MiB).
pub const DEFAULT_STREAM_RECEIVE_WINDOW: u32 = 15 * 1024 * 1024;

/// Default connection receive window (64 MiB).
pub const DEFAULT_CONNECTION_RECEIVE_WINDOW: u32 = 64 * 1024 * 1024;

/// Buffer for datagrams not yet read by the application.
const DATAGRAM_RECEIVE_BUFFER: usize = 1024 * 1024;

/// Tunable QUIC transport parameters.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Per-stream receive window in bytes (0 = default).
    pub stream_receive_window: u32,
    /// Connection-wide receive window in bytes (0 = default).
    pub connection_receive_window: u32,
    pub idle_timeout: Duration,
    /// Zero disables keep-alive.
    pub keep_alive: Duration,
    pub disable_mtu_discovery: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            stream_receive_window: 0,
            connection_receive_window: 0,
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(10),
            disable_mtu_discovery: false,
        }
    }
}

impl TransportOptions {
    fn stream_window(&self) -> u32 {
        match self.stream_receive_window {
            0 => DEFAULT_STREAM_RECEIVE_WINDOW,
            n => n,
        }
    }

    fn connection_window(&self) -> u32 {
        match self.connection_receive_window {
            0 => DEFAULT_CONNECTION_RECEIVE_WINDOW,
            n => n,
        }
    }

    /// Builds the quinn transport configuration.
    pub fn build(
        &self,
        congestion: Option<Arc<dyn quinn::congestion::ControllerFactory + Send + Sync>>,
    ) -> Result<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        config.stream_receive_window(VarInt::from_u32(self.stream_window()));
        config.receive_window(VarInt::from_u32(self.connection_window()));
        config.max_idle_timeout(Some(
            self.idle_timeout
                .try_into()
                .map_err(|_| Error::Config("idle timeout too large".to_string()))?,
        ));
        if !self.keep_alive.is_zero() {
            config.keep_alive_interval(Some(self.keep_alive));
        }
        if self.disable_mtu_discovery {
            config.mtu_discovery_config(None);
        }
        config.datagram_receive_buffer_size(Some(DATAGRAM_RECEIVE_BUFFER));
        if let Some(factory) = congestion {
            config.congestion_controller_factory(factory);
        }
        Ok(config)
    }
}

/// UDP socket that obfuscates outgoing and deobfuscates incoming packets.
pub struct ObfsUdpSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    obfuscator: Arc<dyn Obfuscator>,
}

impl ObfsUdpSocket {
    pub fn new(inner: Arc<dyn AsyncUdpSocket>, obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self { inner, obfuscator }
    }
}

impl fmt::Debug for ObfsUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObfsUdpSocket")
            .field("inner", &self.inner)
            .field("obfuscator", &self.obfuscator)
            .finish()
    }
}

impl AsyncUdpSocket for ObfsUdpSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let mut contents = transmit.contents.to_vec();
        // Each GSO segment is a separate packet on the wire.
        let segment = transmit.segment_size.unwrap_or(contents.len()).max(1);
        for packet in contents.chunks_mut(segment) {
            self.obfuscator.obfuscate(packet);
        }
        self.inner.try_send(&Transmit {
            destination: transmit.destination,
            ecn: transmit.ecn,
            contents: &contents,
            segment_size: transmit.segment_size,
            src_ip: transmit.src_ip,
        })
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let count = match self.inner.poll_recv(cx, bufs, meta) {
            Poll::Ready(Ok(count)) => count,
            other => return other,
        };
        for (buf, meta) in bufs.iter_mut().zip(meta.iter()).take(count) {
            // GRO may coalesce several packets of `stride` bytes into one buffer.
            let stride = meta.stride.max(1);
            for packet in buf[..meta.len].chunks_mut(stride) {
                self.obfuscator.deobfuscate(packet);
            }
        }
        Poll::Ready(Ok(count))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}

/// Binds a QUIC endpoint on `bind`, optionally obfuscating every packet.
///
/// Passing a `server_config` makes the endpoint accept connections too; the
/// client only ever passes `None`.
pub fn bind_endpoint(
    bind: SocketAddr,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    server_config: Option<quinn::ServerConfig>,
) -> Result<Endpoint> {
    let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
    let socket = std::net::UdpSocket::bind(bind)
        .map_err(|e| Error::Network(format!("failed to bind UDP socket {}: {}", bind, e)))?;
    let socket = runtime.wrap_udp_socket(socket)?;

    let socket: Arc<dyn AsyncUdpSocket> = match obfuscator {
        Some(obfuscator) => Arc::new(ObfsUdpSocket::new(socket, obfuscator)),
        None => socket,
    };

    Endpoint::new_with_abstract_socket(EndpointConfig::default(), server_config, socket, runtime)
        .map_err(|e| Error::Network(format!("failed to create QUIC endpoint: {}", e)))
}

/// Unspecified local address of the same family as `remote`.
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfs::XorObfuscator;

    #[test]
    fn test_default_windows() {
        let options = TransportOptions::default();
        assert_eq!(options.stream_window(), DEFAULT_STREAM_RECEIVE_WINDOW);
        assert_eq!(options.connection_window(), DEFAULT_CONNECTION_RECEIVE_WINDOW);
    }

    #[test]
    fn test_custom_windows() {
        let options = TransportOptions {
            stream_receive_window: 1024,
            connection_receive_window: 4096,
            ..TransportOptions::default()
        };
        assert_eq!(options.stream_window(), 1024);
        assert_eq!(options.connection_window(), 4096);
    }

    #[test]
    fn test_build_transport_config() {
        let options = TransportOptions {
            keep_alive: Duration::ZERO,
            disable_mtu_discovery: true,
            ..TransportOptions::default()
        };
        assert!(options.build(None).is_ok());
    }

    #[test]
    fn test_unspecified_for() {
        let v4: SocketAddr = "1.2.3.4:443".parse().unwrap();
        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        assert!(unspecified_for(&v4).is_ipv4());
        assert!(unspecified_for(&v6).is_ipv6());
    }

    /// Two obfuscated sockets exchange a packet and the receiver sees plaintext.
    #[tokio::test]
    async fn test_obfs_socket_roundtrip() {
        let runtime = TokioRuntime;
        let obfs: Arc<dyn Obfuscator> = Arc::new(XorObfuscator::new(b"key"));

        let raw_a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let raw_b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b_addr = raw_b.local_addr().unwrap();

        let a = ObfsUdpSocket::new(runtime.wrap_udp_socket(raw_a).unwrap(), obfs.clone());
        let b = ObfsUdpSocket::new(runtime.wrap_udp_socket(raw_b).unwrap(), obfs);

        let transmit = Transmit {
            destination: b_addr,
            ecn: None,
            contents: b"hello obfuscated world",
            segment_size: None,
            src_ip: None,
        };
        // A freshly registered socket may not be writable until the reactor turns.
        let mut attempts = 0;
        loop {
            match a.try_send(&transmit) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < 100 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("send failed: {}", e),
            }
        }

        let mut storage = [0u8; 1500];
        let received = std::future::poll_fn(|cx| {
            let mut bufs = [IoSliceMut::new(&mut storage)];
            let mut meta = [RecvMeta::default()];
            match b.poll_recv(cx, &mut bufs, &mut meta) {
                Poll::Ready(Ok(n)) => {
                    assert_eq!(n, 1);
                    Poll::Ready(meta[0].len)
                }
                Poll::Ready(Err(e)) => panic!("recv failed: {}", e),
                Poll::Pending => Poll::Pending,
            }
        })
        .await;

        assert_eq!(&storage[..received], b"hello obfuscated world");
    }
}
