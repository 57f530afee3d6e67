//! Server configuration

use serde::Deserialize;
use std::collections::HashSet;

use crate::error::ProxyError;

/// Tunnel server settings. All durations are plain seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control listener binds to.
    pub bind_addr: String,
    pub bind_port: u16,
    /// Advertised UDP port, echoed to clients in the login response.
    pub bind_udp_port: u16,
    /// Address public proxy listeners bind to.
    pub proxy_bind_addr: String,

    /// Shared authentication token.
    pub token: String,

    /// Upper bound on any client's requested work-connection pool size.
    pub max_pool_count: usize,
    /// Per-client public port quota; 0 disables the check.
    pub max_ports_per_client: u64,

    /// Session dies when no valid ping arrives for this long.
    pub heartbeat_timeout_secs: u64,
    /// How long a user connection may wait for a work connection.
    pub user_conn_timeout_secs: u64,

    /// Report full error text to clients instead of a summary.
    pub detailed_errors_to_client: bool,

    /// Ports clients may claim, e.g. "2000-3000,3001"; `None` allows all.
    pub allow_ports: Option<String>,

    /// Accept multiplexed control connections.
    pub tcp_mux: bool,

    /// Base URL of the external registry ("adapter") service; `None`
    /// disables the side-effects.
    pub adapter_server_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            bind_udp_port: 0,
            proxy_bind_addr: "0.0.0.0".to_string(),
            token: String::new(),
            max_pool_count: 5,
            max_ports_per_client: 0,
            heartbeat_timeout_secs: 90,
            user_conn_timeout_secs: 10,
            detailed_errors_to_client: true,
            allow_ports: None,
            tcp_mux: true,
            adapter_server_address: None,
        }
    }
}

impl ServerConfig {
    /// Expand `allow_ports` into a set; `None` when unrestricted.
    pub fn allowed_ports(&self) -> Result<Option<HashSet<u64>>, ProxyError> {
        match &self.allow_ports {
            None => Ok(None),
            Some(spec) => {
                let numbers = burrow_util::parse_range_numbers(spec)
                    .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;
                Ok(Some(numbers.into_iter().collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_port, 7000);
        assert_eq!(cfg.heartbeat_timeout_secs, 90);
        assert_eq!(cfg.max_ports_per_client, 0);
        assert!(cfg.detailed_errors_to_client);
        assert!(cfg.allowed_ports().unwrap().is_none());
    }

    #[test]
    fn test_allowed_ports_expansion() {
        let cfg = ServerConfig {
            allow_ports: Some("6000-6002,7001".to_string()),
            ..Default::default()
        };
        let ports = cfg.allowed_ports().unwrap().unwrap();
        assert_eq!(ports.len(), 4);
        assert!(ports.contains(&6000));
        assert!(ports.contains(&7001));
        assert!(!ports.contains(&7000));
    }

    #[test]
    fn test_invalid_allow_ports() {
        let cfg = ServerConfig {
            allow_ports: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.allowed_ports(),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }
}
