//! Tunnel client binary

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_client::{ClientConfig, ClientService, ProxyConf};
use burrow_proto::ProxyType;

/// Expose a local TCP service through a burrow server.
#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "Connect to a burrow server and expose local services", long_about = None)]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    server_addr: String,

    /// Server control port
    #[arg(long, default_value = "7000")]
    server_port: u16,

    /// Authentication token (must match the server)
    #[arg(long, env = "BURROW_TOKEN", default_value = "")]
    token: String,

    /// User name reported at login
    #[arg(long, default_value = "")]
    user: String,

    /// Name of the announced proxy
    #[arg(long, default_value = "tcp")]
    proxy_name: String,

    /// Local port to expose
    #[arg(long)]
    local_port: u16,

    /// Local address the service listens on
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: String,

    /// Public port to request; 0 lets the server pick
    #[arg(long, default_value = "0")]
    remote_port: u16,

    /// Steady-state work-connection pool size
    #[arg(long, default_value = "1")]
    pool_count: usize,

    /// Multiplex everything over one TCP connection
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    tcp_mux: bool,

    /// Wrap the server connection in TLS
    #[arg(long)]
    tls: bool,

    /// HTTP CONNECT proxy for reaching the server
    #[arg(long)]
    http_proxy: Option<String>,

    /// Exit instead of retrying when the first login fails
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    login_fail_exit: bool,

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

    let cfg = ClientConfig {
        server_addr: cli.server_addr,
        server_port: cli.server_port,
        token: cli.token,
        user: cli.user,
        pool_count: cli.pool_count,
        tcp_mux: cli.tcp_mux,
        tls_enable: cli.tls,
        http_proxy: cli.http_proxy,
        login_fail_exit: cli.login_fail_exit,
        proxies: vec![ProxyConf {
            name: cli.proxy_name,
            proxy_type: ProxyType::Tcp,
            local_ip: cli.local_ip,
            local_port: cli.local_port,
            remote_port: cli.remote_port,
        }],
        ..Default::default()
    };

    let service = ClientService::new(cfg);

    let svc = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            svc.close();
        }
    });

    service.run().await?;
    Ok(())
}
