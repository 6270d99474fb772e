//! Fixture Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use fixture_mock_server::config::BackendConfig;
use fixture_mock_server::{server, ServerConfig, Simulator};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "fixture-mock-server",
    about = "Development mock server - JSON fixtures, backend fallback, latency and error simulation",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 80)]
    port: u16,

    /// Backend base URL to try before fixtures
    #[arg(short, long, env = "SERVER")]
    backend: Option<String>,

    /// Fixture directory (overrides the config file)
    #[arg(short, long, env = "FIXTURES_DIR")]
    fixtures: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&ServerConfig::default())?);
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        ServerConfig::default()
    };

    // Command line and environment take precedence over the file
    if let Some(root) = args.fixtures {
        config.fixtures.root = root;
    }
    if let Some(url) = args.backend.filter(|u| !u.trim().is_empty()) {
        let timeout_ms = config.backend.as_ref().map(|b| b.timeout_ms);
        let mut backend = BackendConfig::new(url);
        if let Some(timeout_ms) = timeout_ms {
            backend.timeout_ms = timeout_ms;
        }
        config.backend = Some(backend);
    }
    config.validate()?;

    if args.validate {
        println!("Configuration is valid");
        return Ok(());
    }

    if !config.fixtures.root.is_dir() {
        warn!(root = %config.fixtures.root.display(), "Fixture root is not a directory, every lookup will miss");
    }

    let simulator = Arc::new(Simulator::new(&config)?);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = TcpListener::bind(addr).await?;

    let stats_source = simulator.clone();
    server::serve(listener, simulator, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    })
    .await?;

    info!(stats = ?stats_source.stats(), "Mock server stopped");
    Ok(())
}
