//! hytun - QUIC tunnel client.
//!
//! One authenticated, optionally obfuscated QUIC connection carries every
//! proxied TCP connection as its own stream and every UDP flow as
//! unreliable datagrams. Sending is paced by a fixed-rate ("Brutal")
//! congestion controller, and an ACL decides per destination whether
//! traffic is proxied, sent direct, blocked or hijacked.

pub mod acl;
pub mod app;
pub mod cli;
pub mod client;
pub mod common;
pub mod congestion;
pub mod datagram;
pub mod error;
pub mod obfs;
pub mod observer;
pub mod protocol;
pub mod relay;
pub mod tls;
pub mod transport;

pub use acl::{AclEngine, AclError, Action, Decision, Matcher, PortRange, Resolve, Rule};
pub use app::{client_config, load_acl, run_client};
pub use cli::{BuildInfo, Cli, ClientArgs, Command};
pub use client::{negotiated_send_bps, Client, ClientConfig, ServerBandwidth, TunnelStream};
pub use common::{
    build_tls_config, join_host_port, split_host_port, DnsResolver, SecurityMode, TlsOptions,
};
pub use congestion::{
    BandwidthHandle, Brutal, BrutalConfig, BrutalController, BrutalState, CongestionFactory,
};
pub use datagram::UdpSession;
pub use error::{Error, ExitCode, Result};
pub use obfs::{Obfuscator, XorObfuscator};
pub use observer::{ErrorEvent, Network, RequestEvent, RequestObserver, TracingObserver};
pub use protocol::{
    decode_varint, encode_varint, read_frame, write_frame, Frame, ProtocolError, ProtocolResult,
    UdpMessage, DEFAULT_ALPN, PROTOCOL_VERSION,
};
pub use relay::{RelayConfig, TcpRelay, UdpRelay};
pub use tls::{compute_fingerprint, format_fingerprint, parse_fingerprint, TlsError, TlsResult};
pub use transport::{bind_endpoint, TransportOptions};
