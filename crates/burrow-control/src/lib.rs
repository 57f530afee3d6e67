//! Server-side control plane: per-client control sessions, the
//! work-connection pool protocol, proxy registration and the external
//! registry side-effects.

mod adapter;
mod config;
mod control;
mod error;
mod manager;
mod metrics;
mod plugin;
mod proxy;

pub use adapter::AdapterClient;
pub use config::ServerConfig;
pub use control::{Control, ControlStatus};
pub use error::{response_error_string, ControlError, PluginError, ProxyError};
pub use manager::ControlManager;
pub use metrics::ServerMetrics;
pub use plugin::{Plugin, PluginManager, UserInfo};
pub use proxy::{Proxy, ProxyInfo, ProxyManager, TcpProxy, WorkConnFetcher};

use burrow_auth::AuthVerifier;
use std::sync::Arc;

/// Shared server-wide collaborators handed to every control session.
pub struct ServerResources {
    pub cfg: Arc<ServerConfig>,
    pub auth: Arc<AuthVerifier>,
    pub plugins: Arc<PluginManager>,
    pub proxy_manager: Arc<ProxyManager>,
    pub adapter: Option<Arc<AdapterClient>>,
    pub metrics: Arc<ServerMetrics>,
}

impl ServerResources {
    /// Wire up resources for `cfg` with an empty plugin chain.
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let auth = Arc::new(AuthVerifier::new(cfg.token.clone()));
        let adapter = cfg
            .adapter_server_address
            .as_ref()
            .map(|addr| Arc::new(AdapterClient::new(addr.clone())));
        Arc::new(Self {
            cfg: Arc::new(cfg),
            auth,
            plugins: Arc::new(PluginManager::new()),
            proxy_manager: Arc::new(ProxyManager::new()),
            adapter,
            metrics: Arc::new(ServerMetrics::new()),
        })
    }
}
