//! Client configuration

use serde::Deserialize;
use std::collections::HashMap;

use burrow_proto::ProxyType;

/// Tunnel client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,

    /// Shared authentication token.
    pub token: String,
    pub user: String,
    pub metas: HashMap<String, String>,

    /// Steady-state number of pre-dialed work connections.
    pub pool_count: usize,

    /// Multiplex the control channel and work connections over one TCP
    /// connection.
    pub tcp_mux: bool,

    /// Wrap the connection to the server in TLS. Certificate verification
    /// is skipped: the control channel carries its own encryption layer.
    pub tls_enable: bool,

    /// Optional HTTP CONNECT proxy for reaching the server.
    pub http_proxy: Option<String>,

    /// Give up instead of retrying when the very first login fails.
    pub login_fail_exit: bool,

    /// Seconds between heartbeat pings.
    pub heartbeat_interval_secs: u64,
    /// Session dies when no pong arrives for this long.
    pub heartbeat_timeout_secs: u64,

    pub proxies: Vec<ProxyConf>,
    pub visitors: Vec<VisitorConf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            server_port: 7000,
            token: String::new(),
            user: String::new(),
            metas: HashMap::new(),
            pool_count: 1,
            tcp_mux: true,
            tls_enable: false,
            http_proxy: None,
            login_fail_exit: true,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

/// A service behind the client that should be reachable through the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConf {
    pub name: String,
    pub proxy_type: ProxyType,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    pub local_port: u16,
    /// Public port to request; 0 lets the server pick.
    #[serde(default)]
    pub remote_port: u16,
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

impl ProxyConf {
    pub fn local_addr(&self) -> (String, u16) {
        (self.local_ip.clone(), self.local_port)
    }
}

/// Descriptor for connecting to another client's secret proxy. Carried in
/// the session state; the visitor data plane lives outside this core.
#[derive(Debug, Clone, Deserialize)]
pub struct VisitorConf {
    pub name: String,
    pub proxy_type: ProxyType,
    pub server_name: String,
    #[serde(default = "default_local_ip")]
    pub bind_addr: String,
    pub bind_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server_port, 7000);
        assert_eq!(cfg.pool_count, 1);
        assert!(cfg.tcp_mux);
        assert!(cfg.login_fail_exit);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_proxy_conf_from_json() {
        let conf: ProxyConf = serde_json::from_str(
            r#"{"name":"web","proxy_type":"tcp","local_port":8080,"remote_port":6000}"#,
        )
        .unwrap();
        assert_eq!(conf.local_ip, "127.0.0.1");
        assert_eq!(conf.local_addr(), ("127.0.0.1".to_string(), 8080));
    }
}
