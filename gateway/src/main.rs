use std::path::PathBuf;

use clap::Parser;

use cloud_codex_core::config::GatewayConfig;
use cloud_codex_gateway::run_main;

/// Cloud Codex gateway: serves one authenticated client over stdio. The
/// boundary layer asserts the user's identity and passes it through.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    /// User id asserted by the boundary layer.
    #[arg(long)]
    user: String,

    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log to stderr; stdout carries the frame stream. `RUST_LOG` controls
    // the level.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::load_from_file(path)?,
        None => GatewayConfig::default(),
    };
    run_main(config, cli.user).await
}
