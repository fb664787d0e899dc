//! hytun - QUIC tunnel client with fixed-rate congestion control.

use clap::Parser;
use hytun::{run_client, BuildInfo, Cli, Command, ExitCode};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    match cli.command {
        Command::Client(args) => {
            tracing::debug!(?args, "client arguments");

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create tokio runtime");
                    std::process::exit(ExitCode::Failure.into());
                }
            };
            if let Err(e) = runtime.block_on(run_client(&args)) {
                tracing::error!(error = %e, "client error");
                std::process::exit(e.exit_code().into());
            }
        }
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
        }
    }
}
