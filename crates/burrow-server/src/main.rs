//! Tunnel server binary

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_control::ServerConfig;
use burrow_server::ServerService;

/// Publicly reachable end of the tunnel: accepts clients and exposes their
/// services.
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Run a burrow tunnel server", long_about = None)]
#[command(version)]
struct Cli {
    /// Control listener bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Control listener port
    #[arg(long, default_value = "7000")]
    bind_port: u16,

    /// Advertised UDP port, echoed to clients at login
    #[arg(long, default_value = "0")]
    bind_udp_port: u16,

    /// Address public proxy listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    proxy_bind_addr: String,

    /// Authentication token (must match clients)
    #[arg(long, env = "BURROW_TOKEN", default_value = "")]
    token: String,

    /// Upper bound on any client's work-connection pool size
    #[arg(long, default_value = "5")]
    max_pool_count: usize,

    /// Per-client public port quota; 0 disables the check
    #[arg(long, default_value = "0")]
    max_ports_per_client: u64,

    /// Seconds without a valid ping before a session is dropped
    #[arg(long, default_value = "90")]
    heartbeat_timeout: u64,

    /// Seconds a user connection may wait for a work connection
    #[arg(long, default_value = "10")]
    user_conn_timeout: u64,

    /// Report full error text to clients instead of a summary
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    detailed_errors_to_client: bool,

    /// Ports clients may claim, e.g. "2000-3000,3001"
    #[arg(long)]
    allow_ports: Option<String>,

    /// Accept multiplexed control connections
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    tcp_mux: bool,

    /// Base URL of the external registry ("adapter") service
    #[arg(long, env = "BURROW_ADAPTER_ADDRESS")]
    adapter_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let cfg = ServerConfig {
        bind_addr: cli.bind_addr,
        bind_port: cli.bind_port,
        bind_udp_port: cli.bind_udp_port,
        proxy_bind_addr: cli.proxy_bind_addr,
        token: cli.token,
        max_pool_count: cli.max_pool_count,
        max_ports_per_client: cli.max_ports_per_client,
        heartbeat_timeout_secs: cli.heartbeat_timeout,
        user_conn_timeout_secs: cli.user_conn_timeout,
        detailed_errors_to_client: cli.detailed_errors_to_client,
        allow_ports: cli.allow_ports,
        tcp_mux: cli.tcp_mux,
        adapter_server_address: cli.adapter_address,
    };

    let service = ServerService::new(cfg);

    // On termination, tell the registry this server is going away, then
    // exit with a non-zero code.
    let adapter = service.resources().adapter.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received");
        if let Some(adapter) = adapter {
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                adapter.notify_server_exit(),
            )
            .await;
        }
        std::process::exit(1);
    });

    service.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
