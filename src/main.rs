use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mcp_proxy::config::ProxyConfig;
use mcp_proxy::proxy::{management, Aggregator, McpServer, Recorder};

#[derive(Parser)]
#[command(
    name = "mcp-proxy",
    version,
    about = "Aggregating MCP proxy: one stdio endpoint fanning out to managed upstream MCP servers"
)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "MCP_PROXY_CONFIG")]
    config: PathBuf,

    /// Log file path (stdout carries the MCP transport, so logs go to a file)
    #[arg(long, default_value = "/tmp/mcp-proxy.log")]
    log: PathBuf,

    /// Record JSON-RPC traffic to this file for later playback
    #[arg(long)]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Startup errors are fatal; runtime upstream failures are not.
    if let Err(e) = run(cli).await {
        eprintln!("mcp-proxy: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    mcp_proxy::init_tracing(&cli.log)
        .map_err(|e| format!("failed to open log file '{}': {e}", cli.log.display()))?;

    tracing::info!(config = %cli.config.display(), "loading configuration");
    let config = ProxyConfig::load(&cli.config)?;
    let settings = config.proxy.effective();
    tracing::info!(
        servers = config.servers.len(),
        health_check_interval = %settings.health_check_interval,
        connection_timeout = %settings.connection_timeout,
        max_retries = settings.max_retries,
        "configuration loaded"
    );

    let server = Arc::new(McpServer::new("mcp-proxy", env!("CARGO_PKG_VERSION")));
    let aggregator = Aggregator::new(server.tool_set(), config.inherit.clone());
    management::register_management_tools(&server.tool_set(), aggregator.clone());

    if let Some(record) = &cli.record {
        let recorder = Recorder::create(
            record,
            &format!("mcp-proxy v{}", env!("CARGO_PKG_VERSION")),
        )
        .map_err(|e| format!("failed to open recording file '{}': {e}", record.display()))?;
        aggregator.enable_recording(Arc::new(recorder));
        tracing::info!(file = %record.display(), "recording enabled");
    }

    // Per-upstream failures here are tolerated: the records stay
    // disconnected and can be restored later via server_reconnect.
    aggregator.connect_static(&config).await;

    tokio::select! {
        result = server.clone().serve_stdio() => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    aggregator.shutdown_all().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
