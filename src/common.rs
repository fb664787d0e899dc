//! Common types and functions shared across the client and its front-ends.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::acl::Resolve;
use crate::error::{Error, Result};
use crate::tls::{
    build_client_config_ca, build_client_config_fingerprint, build_client_config_insecure,
    parse_fingerprint,
};

/// Buffer size for relaying UDP packets.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Security mode for TLS verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityMode {
    /// CA certificate validation (default or custom CA).
    Ca,
    /// Public key fingerprint validation.
    Fingerprint,
    /// No verification (insecure, development only).
    None,
}

/// TLS settings for the connection to the server.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// SNI hostname; defaults to the host part of the server address.
    pub sni: Option<String>,
    pub ca: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub fingerprint: Option<String>,
    pub alpn: String,
}

impl SecurityMode {
    /// Determines the security mode from TLS options.
    pub fn from_options(options: &TlsOptions) -> Self {
        if options.insecure_skip_verify {
            SecurityMode::None
        } else if options.fingerprint.is_some() {
            SecurityMode::Fingerprint
        } else {
            SecurityMode::Ca
        }
    }
}

/// Builds TLS client configuration based on options.
pub fn build_tls_config(options: &TlsOptions) -> Result<rustls::ClientConfig> {
    let alpn = options.alpn.as_str();
    match (SecurityMode::from_options(options), options.fingerprint.as_deref()) {
        (SecurityMode::None, _) => build_client_config_insecure(alpn)
            .map_err(|e| Error::TlsVerificationFailed(e.to_string())),
        (SecurityMode::Fingerprint, Some(fp_str)) => {
            let fingerprint = parse_fingerprint(fp_str)
                .map_err(|e| Error::TlsVerificationFailed(e.to_string()))?;
            build_client_config_fingerprint(&fingerprint, alpn)
                .map_err(|e| Error::TlsVerificationFailed(e.to_string()))
        }
        _ => build_client_config_ca(options.ca.as_deref(), alpn)
            .map_err(|e| Error::TlsVerificationFailed(e.to_string())),
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host_part, port_part) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address must include port: '{}'", addr)))?;

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };
    if host.is_empty() {
        return Err(Error::Config(format!("address must include host: '{}'", addr)));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", addr)))?;

    Ok((host.to_string(), port))
}

/// Joins a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Resolves the server address and extracts the host for SNI.
pub async fn resolve_server_address(
    server: &str,
    sni: Option<&str>,
    resolver: &DnsResolver,
) -> Result<(SocketAddr, String)> {
    let (host, port) = split_host_port(server)?;
    let addr = resolver.resolve(&host, port).await?;
    let sni_host = sni.map(|s| s.to_string()).unwrap_or(host);
    Ok((addr, sni_host))
}

/// Shared DNS resolver, lazily initialised and reused across lookups.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: Arc<Mutex<Option<hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>>>>,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to its first IP address.
    pub async fn lookup(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        // Clone the handle out so lookups do not serialise on the lock.
        let resolver = {
            let mut resolver_guard = self.resolver.lock().await;
            if resolver_guard.is_none() {
                let resolver = hickory_resolver::Resolver::builder_tokio()
                    .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                    .build();
                *resolver_guard = Some(resolver);
            }
            resolver_guard
                .clone()
                .ok_or_else(|| Error::Config("DNS resolver unavailable".to_string()))?
        };

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Network(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .ok_or_else(|| Error::Network(format!("no addresses found for '{}'", host)))
    }

    /// Resolves a hostname to a SocketAddr.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        self.lookup(host).await.map(|ip| SocketAddr::new(ip, port))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for DnsResolver {
    async fn resolve_ip(&self, host: &str) -> Option<IpAddr> {
        match self.lookup(host).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::debug!(host, error = %e, "ACL resolution failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(insecure: bool, fp: Option<&str>) -> TlsOptions {
        TlsOptions {
            insecure_skip_verify: insecure,
            fingerprint: fp.map(str::to_string),
            alpn: "hytun/1".to_string(),
            ..TlsOptions::default()
        }
    }

    #[test]
    fn test_security_mode_default() {
        assert_eq!(SecurityMode::from_options(&options(false, None)), SecurityMode::Ca);
    }

    #[test]
    fn test_security_mode_fingerprint() {
        assert_eq!(
            SecurityMode::from_options(&options(false, Some("aa:bb"))),
            SecurityMode::Fingerprint
        );
    }

    #[test]
    fn test_security_mode_insecure_takes_precedence() {
        assert_eq!(
            SecurityMode::from_options(&options(true, Some("aa:bb"))),
            SecurityMode::None
        );
    }

    #[test]
    fn test_build_tls_config_bad_fingerprint() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let result = build_tls_config(&options(false, Some("not-hex")));
        assert!(matches!(result, Err(Error::TlsVerificationFailed(_))));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(split_host_port("[::1]:53").unwrap(), ("::1".to_string(), 53));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("example.com:http").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn test_dns_resolver_ip_address() {
        let resolver = DnsResolver::new();
        let addr = resolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_resolve_server_address_with_sni() {
        let resolver = DnsResolver::new();
        let (addr, sni) = resolve_server_address("127.0.0.1:9443", Some("example.com"), &resolver)
            .await
            .unwrap();
        assert_eq!(addr.port(), 9443);
        assert_eq!(sni, "example.com");
    }

    #[tokio::test]
    async fn test_resolve_server_address_ipv6() {
        let resolver = DnsResolver::new();
        let (addr, sni) = resolve_server_address("[::1]:9443", None, &resolver)
            .await
            .unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(sni, "::1");
    }

    #[tokio::test]
    async fn test_resolver_as_acl_resolver() {
        let resolver = DnsResolver::new();
        assert_eq!(
            resolver.resolve_ip("10.0.0.7").await,
            Some("10.0.0.7".parse().unwrap())
        );
    }
}
