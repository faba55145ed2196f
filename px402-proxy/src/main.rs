//! px402 proxy binary: stdio on the local side, negotiated HTTP/SSE on
//! the remote side.
//!
//! # Usage
//!
//! ```bash
//! # Stream-first against a remote server
//! px402-proxy https://example.com/mcp
//!
//! # Force per-request HTTP and attach static headers
//! px402-proxy https://example.com/mcp --strategy request-only \
//!     --header X-Api-Key=abc123
//!
//! # Configure logging level
//! RUST_LOG=debug px402-proxy https://example.com/mcp
//! ```
//!
//! The binary wires no signer; payment challenges pass through enriched
//! only when a library embedder supplies one. Identity headers are
//! injected whenever a token or static headers are configured.

use std::sync::Arc;

use clap::Parser;
use px402::protocol::HeaderSet;
use px402_proxy::inject::IdentityConfig;
use px402_proxy::negotiate::{ConnectionStrategy, NativeFactory, Negotiator};
use px402_proxy::proxy;
use px402_proxy::transport::StdioTransport;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "px402-proxy", version, about)]
struct Cli {
    /// Remote server URL.
    url: Url,

    /// Transport negotiation strategy.
    #[arg(long, value_enum, default_value = "stream-first")]
    strategy: ConnectionStrategy,

    /// Static header attached to every outbound send (repeatable).
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Bearer token for outbound identity proofs.
    #[arg(long, env = "PX402_IDENTITY_TOKEN")]
    identity_token: Option<String>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("Proxy failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut negotiator = Negotiator::new(Arc::new(NativeFactory::new()));
    if cli.identity_token.is_some() || !cli.headers.is_empty() {
        let mut static_headers = HeaderSet::new();
        for (name, value) in &cli.headers {
            static_headers.insert(name, value);
        }
        negotiator = negotiator.with_identity(IdentityConfig {
            token: cli.identity_token.clone(),
            static_headers,
            ..IdentityConfig::default()
        });
    }

    tracing::info!(url = %cli.url, strategy = ?cli.strategy, "connecting to remote");
    let remote = negotiator.connect(&cli.url, cli.strategy).await?;
    let local = Arc::new(StdioTransport::stdio());

    let handle = proxy::wire(local, remote, None);
    tokio::select! {
        () = handle.join() => tracing::info!("proxy finished"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down..."),
    }
    Ok(())
}
