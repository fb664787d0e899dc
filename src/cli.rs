//! CLI definitions for hytun.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_ALPN;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// QUIC tunnel client with fixed-rate congestion control.
#[derive(Debug, Parser)]
#[command(name = "hytun")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a server and run the configured local front-ends
    Client(ClientArgs),

    /// Show version information
    Version,
}

/// Arguments for the client subcommand.
#[derive(Parser)]
pub struct ClientArgs {
    /// Server address (e.g., server.example.com:443)
    #[arg(long)]
    pub server: String,

    /// Authentication token
    #[arg(long, conflicts_with = "auth_file")]
    pub auth: Option<String>,

    /// File whose raw contents are the authentication token
    #[arg(long)]
    pub auth_file: Option<PathBuf>,

    /// Upload bandwidth in Mbps
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub up_mbps: u64,

    /// Download bandwidth in Mbps
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub down_mbps: u64,

    /// Obfuscation key; the server must use the same one
    #[arg(long)]
    pub obfs: Option<String>,

    /// ACL rule file
    #[arg(long)]
    pub acl: Option<PathBuf>,

    /// TLS SNI hostname
    #[arg(long)]
    pub sni: Option<String>,

    /// Root CA certificate file path
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Disable certificate verification (development only)
    #[arg(long, default_value_t = false)]
    pub insecure_skip_verify: bool,

    /// Certificate fingerprint (SHA-256 hex)
    #[arg(long)]
    pub fingerprint: Option<String>,

    /// ALPN protocol identifier
    #[arg(long, default_value = DEFAULT_ALPN)]
    pub alpn: String,

    /// QUIC stream receive window in bytes (0 for default)
    #[arg(long, default_value_t = 0)]
    pub stream_receive_window: u32,

    /// QUIC connection receive window in bytes (0 for default)
    #[arg(long, default_value_t = 0)]
    pub connection_receive_window: u32,

    /// QUIC idle timeout
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub idle_timeout: Duration,

    /// QUIC keep-alive interval (0 to disable)
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub keep_alive: Duration,

    /// Disable QUIC path MTU discovery
    #[arg(long, default_value_t = false)]
    pub disable_mtu_discovery: bool,

    /// TCP relay listen address
    #[arg(long, requires = "tcp_relay_remote")]
    pub tcp_relay_listen: Option<String>,

    /// TCP relay destination (host:port)
    #[arg(long, requires = "tcp_relay_listen")]
    pub tcp_relay_remote: Option<String>,

    /// TCP relay idle timeout (0 to disable)
    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub tcp_relay_timeout: Duration,

    /// UDP relay listen address
    #[arg(long, requires = "udp_relay_remote")]
    pub udp_relay_listen: Option<String>,

    /// UDP relay destination (host:port)
    #[arg(long, requires = "udp_relay_listen")]
    pub udp_relay_remote: Option<String>,

    /// UDP relay session idle timeout
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    pub udp_relay_timeout: Duration,
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

// Secrets are redacted so the arguments can be logged at debug level.
impl std::fmt::Debug for ClientArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientArgs")
            .field("server", &self.server)
            .field("auth", &redact(&self.auth))
            .field("auth_file", &self.auth_file)
            .field("up_mbps", &self.up_mbps)
            .field("down_mbps", &self.down_mbps)
            .field("obfs", &redact(&self.obfs))
            .field("acl", &self.acl)
            .field("sni", &self.sni)
            .field("ca", &self.ca)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("fingerprint", &self.fingerprint)
            .field("alpn", &self.alpn)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("connection_receive_window", &self.connection_receive_window)
            .field("idle_timeout", &self.idle_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("disable_mtu_discovery", &self.disable_mtu_discovery)
            .field("tcp_relay_listen", &self.tcp_relay_listen)
            .field("tcp_relay_remote", &self.tcp_relay_remote)
            .field("tcp_relay_timeout", &self.tcp_relay_timeout)
            .field("udp_relay_listen", &self.udp_relay_listen)
            .field("udp_relay_remote", &self.udp_relay_remote)
            .field("udp_relay_timeout", &self.udp_relay_timeout)
            .finish()
    }
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("HYTUN_COMMIT").unwrap_or("unknown"),
            built: option_env!("HYTUN_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "hytun version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn client_args(extra: &[&str]) -> ClientArgs {
        let mut argv = vec![
            "hytun",
            "client",
            "--server",
            "server.example.com:443",
            "--up-mbps",
            "100",
            "--down-mbps",
            "500",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Client(args) => args,
            _ => panic!("Expected Client command"),
        }
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_client_minimal() {
        let args = client_args(&[]);
        assert_eq!(args.server, "server.example.com:443");
        assert_eq!(args.up_mbps, 100);
        assert_eq!(args.down_mbps, 500);
        assert!(args.auth.is_none());
        assert!(args.obfs.is_none());
        assert!(args.acl.is_none());
        assert!(!args.insecure_skip_verify);
        assert_eq!(args.alpn, DEFAULT_ALPN);
        assert_eq!(args.stream_receive_window, 0);
        assert_eq!(args.idle_timeout, Duration::from_secs(30));
        assert_eq!(args.keep_alive, Duration::from_secs(10));
        assert_eq!(args.udp_relay_timeout, Duration::from_secs(60));
        assert!(args.tcp_relay_listen.is_none());
    }

    #[test]
    fn test_parse_client_full() {
        let args = client_args(&[
            "--auth",
            "secret",
            "--obfs",
            "shape",
            "--acl",
            "/etc/hytun/acl.txt",
            "--sni",
            "custom.example.com",
            "--fingerprint",
            "aa:bb:cc:dd",
            "--alpn",
            "custom/1",
            "--stream-receive-window",
            "1048576",
            "--connection-receive-window",
            "4194304",
            "--idle-timeout",
            "1m30s",
            "--keep-alive",
            "500ms",
            "--disable-mtu-discovery",
            "--tcp-relay-listen",
            "127.0.0.1:2222",
            "--tcp-relay-remote",
            "10.0.0.1:22",
            "--tcp-relay-timeout",
            "5m",
            "--udp-relay-listen",
            "127.0.0.1:5353",
            "--udp-relay-remote",
            "8.8.8.8:53",
        ]);

        assert_eq!(args.auth.as_deref(), Some("secret"));
        assert_eq!(args.obfs.as_deref(), Some("shape"));
        assert_eq!(args.acl, Some(PathBuf::from("/etc/hytun/acl.txt")));
        assert_eq!(args.sni.as_deref(), Some("custom.example.com"));
        assert_eq!(args.fingerprint.as_deref(), Some("aa:bb:cc:dd"));
        assert_eq!(args.alpn, "custom/1");
        assert_eq!(args.stream_receive_window, 1_048_576);
        assert_eq!(args.connection_receive_window, 4_194_304);
        assert_eq!(args.idle_timeout, Duration::from_secs(90));
        assert_eq!(args.keep_alive, Duration::from_millis(500));
        assert!(args.disable_mtu_discovery);
        assert_eq!(args.tcp_relay_remote.as_deref(), Some("10.0.0.1:22"));
        assert_eq!(args.tcp_relay_timeout, Duration::from_secs(300));
        assert_eq!(args.udp_relay_listen.as_deref(), Some("127.0.0.1:5353"));
    }

    #[test]
    fn test_args_debug_redacts_secrets() {
        let args = client_args(&["--auth", "hunter2-secret", "--obfs", "shape-key"]);
        let debug = format!("{:?}", args);
        assert!(debug.contains("server.example.com:443"));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2-secret"));
        assert!(!debug.contains("shape-key"));

        let debug = format!("{:?}", client_args(&[]));
        assert!(debug.contains("auth: None"));
    }

    #[test]
    fn test_relay_listen_requires_remote() {
        let result = Cli::try_parse_from([
            "hytun",
            "client",
            "--server",
            "s:443",
            "--up-mbps",
            "1",
            "--down-mbps",
            "1",
            "--tcp-relay-listen",
            "127.0.0.1:2222",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_auth_and_auth_file_conflict() {
        let result = Cli::try_parse_from([
            "hytun",
            "client",
            "--server",
            "s:443",
            "--up-mbps",
            "1",
            "--down-mbps",
            "1",
            "--auth",
            "a",
            "--auth-file",
            "/tmp/token",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_bandwidth_rejected() {
        let result = Cli::try_parse_from([
            "hytun",
            "client",
            "--server",
            "s:443",
            "--up-mbps",
            "0",
            "--down-mbps",
            "1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_missing_required() {
        let result = Cli::try_parse_from(["hytun", "client", "--server", "s:443"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_version() {
        let cli = Cli::try_parse_from(["hytun", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn test_parse_global_log_level() {
        let cli = Cli::try_parse_from(["hytun", "--log-level", "warn", "version"]).unwrap();
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn test_build_info_format() {
        let info = BuildInfo {
            version: "1.0.0",
            commit: "abc1234",
            built: "2025-01-01T00:00:00Z",
        };
        let output = info.format();
        assert!(output.contains("hytun version 1.0.0"));
        assert!(output.contains("commit: abc1234"));
        assert!(output.contains("built:  2025-01-01T00:00:00Z"));
    }
}
