//! Control protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of proxy a client may announce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Stcp => "stcp",
        }
    }
}

/// First message on a new control connection, client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Login {
    pub arch: String,
    pub os: String,
    pub version: String,
    #[serde(default)]
    pub user: String,
    pub pool_count: usize,
    /// Session identity from a previous login; empty on the first attempt.
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub metas: HashMap<String, String>,
    /// Deterministic host identity, lowercase hex (see `burrow_util::unique_id`).
    #[serde(default)]
    pub unique_id: String,
    /// Hardware address backing `unique_id`, reported for the registry.
    #[serde(default)]
    pub mac_address: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

/// Server reply to [`Login`], sent plaintext before the encrypted wrapper
/// takes over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    pub server_udp_port: u16,
    #[serde(default)]
    pub error: String,
}

/// Client announces a proxy it wants the server to listen for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: ProxyType,
    /// Public port requested; 0 lets the server pick one.
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// First message on a fresh work connection, client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewWorkConn {
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

/// Written by the server on a pooled work connection when it is paired with
/// a user connection; everything after this frame is relayed bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Ping {
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Pong {
    #[serde(default)]
    pub error: String,
}

/// Every frame on the control channel is one of these.
///
/// Unrecognized kinds decode to [`Message::Unknown`] so that older servers
/// tolerate newer clients and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    /// Server demands one more work connection from the client.
    ReqWorkConn,
    NewWorkConn(NewWorkConn),
    StartWorkConn(StartWorkConn),
    Ping(Ping),
    Pong(Pong),
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login(_) => "login",
            Message::LoginResp(_) => "login_resp",
            Message::NewProxy(_) => "new_proxy",
            Message::NewProxyResp(_) => "new_proxy_resp",
            Message::CloseProxy(_) => "close_proxy",
            Message::ReqWorkConn => "req_work_conn",
            Message::NewWorkConn(_) => "new_work_conn",
            Message::StartWorkConn(_) => "start_work_conn",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = Message::Login(Login {
            arch: "x86_64".to_string(),
            os: "linux".to_string(),
            version: "0.3.1".to_string(),
            user: "alice".to_string(),
            pool_count: 2,
            run_id: String::new(),
            metas: HashMap::new(),
            unique_id: "0123456789abcdef0123".to_string(),
            mac_address: "02:42:ac:11:00:02".to_string(),
            privilege_key: "deadbeef".to_string(),
            timestamp: 1700000000,
        });

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let back: Message = serde_json::from_str(r#"{"type":"udp_packet","data":"xx"}"#).unwrap();
        assert_eq!(back, Message::Unknown);
    }

    #[test]
    fn test_req_work_conn_is_unit() {
        let json = serde_json::to_string(&Message::ReqWorkConn).unwrap();
        assert_eq!(json, r#"{"type":"req_work_conn"}"#);
    }

    #[test]
    fn test_login_defaults() {
        // A minimal login from an older client still parses.
        let json = r#"{"type":"login","arch":"arm64","os":"linux","version":"0.1.0",
            "pool_count":1,"privilege_key":"k","timestamp":1}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg {
            Message::Login(l) => {
                assert!(l.run_id.is_empty());
                assert!(l.metas.is_empty());
                assert_eq!(l.pool_count, 1);
            }
            other => panic!("expected login, got {:?}", other),
        }
    }
}
