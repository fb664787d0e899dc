//! Client orchestration: build the configuration, connect, run the front-ends.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;

use crate::acl::AclEngine;
use crate::cli::ClientArgs;
use crate::client::{Client, ClientConfig};
use crate::common::TlsOptions;
use crate::congestion::Brutal;
use crate::error::{Error, Result};
use crate::obfs::{Obfuscator, XorObfuscator};
use crate::observer::{RequestObserver, TracingObserver};
use crate::relay::{RelayConfig, TcpRelay, UdpRelay};
use crate::transport::TransportOptions;

const BITS_PER_MEGABIT: u64 = 1_000_000;

/// Converts command-line arguments into a session configuration.
pub fn client_config(args: &ClientArgs) -> Result<ClientConfig> {
    let auth = match (&args.auth, &args.auth_file) {
        (Some(token), _) => Bytes::from(token.clone().into_bytes()),
        (None, Some(path)) => Bytes::from(std::fs::read(path).map_err(|e| {
            Error::Config(format!("failed to read auth file {}: {}", path.display(), e))
        })?),
        (None, None) => Bytes::new(),
    };

    let obfuscator = args
        .obfs
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(|key| Arc::new(XorObfuscator::new(key.as_bytes())) as Arc<dyn Obfuscator>);

    Ok(ClientConfig {
        server: args.server.clone(),
        auth,
        up_bps: args.up_mbps.saturating_mul(BITS_PER_MEGABIT),
        down_bps: args.down_mbps.saturating_mul(BITS_PER_MEGABIT),
        tls: TlsOptions {
            sni: args.sni.clone(),
            ca: args.ca.clone(),
            insecure_skip_verify: args.insecure_skip_verify,
            fingerprint: args.fingerprint.clone(),
            alpn: args.alpn.clone(),
        },
        transport: TransportOptions {
            stream_receive_window: args.stream_receive_window,
            connection_receive_window: args.connection_receive_window,
            idle_timeout: args.idle_timeout,
            keep_alive: args.keep_alive,
            disable_mtu_discovery: args.disable_mtu_discovery,
        },
        obfuscator,
        congestion: Arc::new(Brutal),
    })
}

/// Loads the ACL file, or an empty rule set that proxies everything.
pub fn load_acl(args: &ClientArgs) -> Result<AclEngine> {
    match &args.acl {
        Some(path) => Ok(AclEngine::load_from_file(path)?),
        None => Ok(AclEngine::default()),
    }
}

fn tcp_relay_config(args: &ClientArgs) -> Option<RelayConfig> {
    Some(RelayConfig {
        listen: args.tcp_relay_listen.clone()?,
        remote: args.tcp_relay_remote.clone()?,
        timeout: args.tcp_relay_timeout,
    })
}

fn udp_relay_config(args: &ClientArgs) -> Option<RelayConfig> {
    Some(RelayConfig {
        listen: args.udp_relay_listen.clone()?,
        remote: args.udp_relay_remote.clone()?,
        timeout: args.udp_relay_timeout,
    })
}

/// Runs the client until a front-end stops, the session ends, or Ctrl-C.
pub async fn run_client(args: &ClientArgs) -> Result<()> {
    // The ACL is checked before any network activity.
    let acl = Arc::new(load_acl(args)?);

    let tcp_relay = tcp_relay_config(args);
    let udp_relay = udp_relay_config(args);
    if tcp_relay.is_none() && udp_relay.is_none() {
        return Err(Error::Config(
            "no front-end configured (use --tcp-relay-* or --udp-relay-*)".to_string(),
        ));
    }

    let config = client_config(args)?;
    tracing::info!(?config, "client configuration loaded");

    let client = Client::connect(config).await?;
    tracing::info!(addr = %args.server, "Connected");

    let observer: Arc<dyn RequestObserver> = Arc::new(TracingObserver);
    let mut frontends = JoinSet::new();
    let result = async {
        if let Some(relay) = &tcp_relay {
            let relay = TcpRelay::bind(relay, client.clone(), Arc::clone(&acl), Arc::clone(&observer)).await?;
            frontends.spawn(async move { relay.run().await });
        }
        if let Some(relay) = &udp_relay {
            let relay = UdpRelay::bind(relay, client.clone(), Arc::clone(&acl), Arc::clone(&observer)).await?;
            frontends.spawn(async move { relay.run().await });
        }
        supervise(&mut frontends).await
    }
    .await;

    frontends.shutdown().await;
    client.close();
    tracing::info!("client shutdown complete");
    result
}

/// Waits for the first front-end to finish or for Ctrl-C.
async fn supervise(frontends: &mut JoinSet<Result<()>>) -> Result<()> {
    tokio::select! {
        joined = frontends.join_next() => match joined {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(Error::Io(std::io::Error::other(format!(
                "front-end task failed: {}",
                e
            )))),
            None => Ok(()),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down...");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Action;
    use crate::cli::{Cli, Command};
    use clap::Parser;
    use std::io::Write;

    fn parse(extra: &[&str]) -> ClientArgs {
        let mut argv = vec![
            "hytun",
            "client",
            "--server",
            "127.0.0.1:4433",
            "--up-mbps",
            "10",
            "--down-mbps",
            "50",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Client(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_client_config_converts_bandwidth() {
        let config = client_config(&parse(&["--auth", "token"])).unwrap();
        assert_eq!(config.up_bps, 10_000_000);
        assert_eq!(config.down_bps, 50_000_000);
        assert_eq!(&config.auth[..], b"token");
        assert!(config.obfuscator.is_none());
    }

    #[test]
    fn test_client_config_reads_auth_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\x01raw").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = client_config(&parse(&["--auth-file", &path])).unwrap();
        assert_eq!(&config.auth[..], b"\x00\x01raw");
    }

    #[test]
    fn test_client_config_obfs() {
        let config = client_config(&parse(&["--obfs", "key"])).unwrap();
        assert!(config.obfuscator.is_some());
    }

    #[test]
    fn test_load_acl_default_proxies() {
        let acl = load_acl(&parse(&[])).unwrap();
        assert_eq!(acl.evaluate("example.com", 443, None).action, &Action::Proxy);
    }

    #[test]
    fn test_load_acl_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "block domain-suffix facebook.com").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let acl = load_acl(&parse(&["--acl", &path])).unwrap();
        assert_eq!(acl.evaluate("www.facebook.com", 443, None).action, &Action::Block);
    }

    #[tokio::test]
    async fn test_invalid_acl_fails_before_connecting() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "allow all").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&[
            "--acl",
            &path,
            "--tcp-relay-listen",
            "127.0.0.1:0",
            "--tcp-relay-remote",
            "127.0.0.1:22",
        ]);
        let err = run_client(&args).await.unwrap_err();
        assert!(matches!(err, Error::Acl(_)));
    }

    #[tokio::test]
    async fn test_no_frontend_is_config_error() {
        let err = run_client(&parse(&[])).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
