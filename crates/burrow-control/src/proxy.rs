//! Proxy capability: public listeners owned by a control session.
//!
//! Only the TCP variant carries a data plane here; every proxy type still
//! goes through the same registration, quota and naming machinery.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use burrow_proto::{write_message, BoxedStream, Message, NewProxy, ProxyType, StartWorkConn};

use crate::error::{ControlError, ProxyError};

/// Callback a proxy uses to pull a work connection from its owning control
/// session when a user connects.
pub type WorkConnFetcher = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<BoxedStream, ControlError>> + Send>>
        + Send
        + Sync,
>;

/// A server-side listener belonging to one client session.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &str;
    fn proxy_type(&self) -> ProxyType;
    /// Public ports this proxy consumes, for the per-client quota.
    fn used_ports_num(&self) -> u64;
    /// Bind and start serving; returns the public address, e.g. `":6000"`.
    async fn run(&mut self) -> Result<String, ProxyError>;
    fn close(&self);
}

/// Build the proxy variant for an announcement.
pub(crate) fn create_proxy(
    msg: &NewProxy,
    bind_addr: String,
    fetcher: WorkConnFetcher,
) -> Result<Box<dyn Proxy>, ProxyError> {
    match msg.proxy_type {
        ProxyType::Tcp => Ok(Box::new(TcpProxy::new(
            msg.proxy_name.clone(),
            bind_addr,
            msg.remote_port,
            fetcher,
        ))),
        other => Err(ProxyError::ConfigInvalid(format!(
            "unsupported proxy type [{}]",
            other.as_str()
        ))),
    }
}

/// TCP proxy: listens on a public port and pairs each accepted user
/// connection with a work connection from the pool.
pub struct TcpProxy {
    name: String,
    bind_addr: String,
    remote_port: u16,
    fetcher: WorkConnFetcher,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpProxy {
    pub fn new(name: String, bind_addr: String, remote_port: u16, fetcher: WorkConnFetcher) -> Self {
        Self {
            name,
            bind_addr,
            remote_port,
            fetcher,
            accept_task: Mutex::new(None),
        }
    }

    async fn serve_user(
        proxy_name: String,
        mut user_conn: tokio::net::TcpStream,
        src_addr: String,
        dst_addr: String,
        fetcher: WorkConnFetcher,
    ) {
        let mut work_conn = match fetcher().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(proxy = %proxy_name, "failed to get work connection: {}", e);
                return;
            }
        };

        let start = Message::StartWorkConn(StartWorkConn {
            proxy_name: proxy_name.clone(),
            src_addr,
            dst_addr,
        });
        if let Err(e) = write_message(&mut work_conn, &start).await {
            warn!(proxy = %proxy_name, "failed to start work connection: {}", e);
            return;
        }

        match tokio::io::copy_bidirectional(&mut user_conn, &mut work_conn).await {
            Ok((to_client, to_user)) => {
                debug!(proxy = %proxy_name, to_client, to_user, "user connection finished");
            }
            Err(e) => debug!(proxy = %proxy_name, "relay ended: {}", e),
        }
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Tcp
    }

    fn used_ports_num(&self) -> u64 {
        1
    }

    async fn run(&mut self) -> Result<String, ProxyError> {
        let listener = TcpListener::bind((self.bind_addr.as_str(), self.remote_port)).await?;
        let local_addr = listener.local_addr()?;
        let remote_addr = format!(":{}", local_addr.port());

        let proxy_name = self.name.clone();
        let fetcher = self.fetcher.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((user_conn, peer)) => {
                        debug!(proxy = %proxy_name, user = %peer, "accepted user connection");
                        tokio::spawn(Self::serve_user(
                            proxy_name.clone(),
                            user_conn,
                            peer.to_string(),
                            local_addr.to_string(),
                            fetcher.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(proxy = %proxy_name, "accept error: {}", e);
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(handle);

        info!(proxy = %self.name, addr = %remote_addr, "tcp proxy listening");
        Ok(remote_addr)
    }

    fn close(&self) {
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Record of a running proxy in the process-wide registry.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub proxy_type: ProxyType,
    pub run_id: String,
}

/// Process-wide proxy-name index; names are unique across all sessions.
#[derive(Debug, Default)]
pub struct ProxyManager {
    proxies: DashMap<String, ProxyInfo>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, info: ProxyInfo) -> Result<(), ProxyError> {
        match self.proxies.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProxyError::NameTaken(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(info);
                Ok(())
            }
        }
    }

    pub fn del(&self, name: &str) {
        self.proxies.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<ProxyInfo> {
        self.proxies.get(name).map(|e| e.value().clone())
    }

    pub fn count(&self) -> usize {
        self.proxies.len()
    }
}
