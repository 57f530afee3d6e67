//! Accept loop: routes fresh connections (or mux streams) to a new control
//! session or into an existing session's work-connection pool, depending on
//! their first message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use burrow_control::{
    response_error_string, Control, ControlManager, ServerConfig, ServerResources,
};
use burrow_mux::MuxSession;
use burrow_proto::{read_message, write_message, BoxedStream, LoginResp, Message};

/// How long a new connection may take to identify itself.
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerService {
    res: Arc<ServerResources>,
    ctl_manager: Arc<ControlManager>,
}

impl ServerService {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            res: ServerResources::new(cfg),
            ctl_manager: Arc::new(ControlManager::new()),
        })
    }

    pub fn resources(&self) -> &Arc<ServerResources> {
        &self.res
    }

    pub fn control_manager(&self) -> &Arc<ControlManager> {
        &self.ctl_manager
    }

    /// Bind the configured control port and serve forever.
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let cfg = &self.res.cfg;
        let listener = TcpListener::bind((cfg.bind_addr.as_str(), cfg.bind_port)).await?;
        info!(addr = %listener.local_addr()?, "burrow server listening");
        self.serve(listener).await
    }

    /// Serve an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    conn.set_nodelay(true).ok();
                    let svc = self.clone();
                    tokio::spawn(async move { svc.handle_connection(conn, peer).await });
                }
                Err(e) => {
                    warn!("accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        debug!(%peer, "new connection");
        if self.res.cfg.tcp_mux {
            // Every stream of the session is treated like a fresh
            // connection: the first carries the login, later ones carry
            // work connections.
            let session = MuxSession::server(conn);
            while let Some(stream) = session.accept_stream().await {
                let svc = self.clone();
                tokio::spawn(async move { svc.route_connection(Box::new(stream), peer).await });
            }
            debug!(%peer, "mux session ended");
        } else {
            self.route_connection(Box::new(conn), peer).await;
        }
    }

    async fn route_connection(self: Arc<Self>, mut conn: BoxedStream, peer: SocketAddr) {
        let first = match tokio::time::timeout(FIRST_MESSAGE_TIMEOUT, read_message(&mut conn)).await
        {
            Err(_) => {
                warn!(%peer, "timed out waiting for first message");
                return;
            }
            Ok(Err(e)) => {
                debug!(%peer, "failed to read first message: {}", e);
                return;
            }
            Ok(Ok(msg)) => msg,
        };

        match first {
            Message::Login(login) => self.handle_login(conn, login, peer).await,
            Message::NewWorkConn(msg) => {
                if let Err(e) = self.res.auth.verify(&msg.privilege_key, msg.timestamp) {
                    warn!(%peer, run_id = %msg.run_id, "work connection auth failed: {}", e);
                    return;
                }
                match self.ctl_manager.get_by_id(&msg.run_id) {
                    Some(ctl) => {
                        if let Err(e) = ctl.register_work_conn(conn) {
                            debug!(%peer, "work connection rejected: {}", e);
                        }
                    }
                    None => {
                        warn!(%peer, run_id = %msg.run_id, "work connection for unknown run id")
                    }
                }
            }
            other => warn!(%peer, kind = other.kind(), "unexpected first message"),
        }
    }

    async fn handle_login(
        self: Arc<Self>,
        mut conn: BoxedStream,
        login: burrow_proto::Login,
        peer: SocketAddr,
    ) {
        if let Err(e) = self.res.auth.verify(&login.privilege_key, login.timestamp) {
            warn!(%peer, user = %login.user, "login failed: {}", e);
            let resp = LoginResp {
                version: env!("CARGO_PKG_VERSION").to_string(),
                error: response_error_string(
                    "authentication failed",
                    &e,
                    self.res.cfg.detailed_errors_to_client,
                ),
                ..Default::default()
            };
            let _ = write_message(&mut conn, &Message::LoginResp(resp)).await;
            return;
        }

        // First login gets a fresh run id; a reconnect presents its old one
        // and thereby reclaims (and replaces) the previous session.
        let run_id = if login.run_id.is_empty() {
            burrow_util::rand_id()
        } else {
            login.run_id.clone()
        };
        info!(
            %peer,
            user = %login.user,
            run_id = %run_id,
            version = %login.version,
            "client login"
        );

        let ctl = Control::new(self.res.clone(), conn, login, run_id.clone());
        if self.ctl_manager.add(&run_id, ctl.clone()).is_some() {
            debug!(run_id = %run_id, "displaced previous control for run id");
        }
        ctl.start().await;
        self.res.metrics.new_client();

        // Deregister once the session has fully torn down. The identity
        // check in `del` keeps a replaced session from removing its
        // successor.
        let manager = self.ctl_manager.clone();
        tokio::spawn(async move {
            ctl.wait_closed().await;
            manager.del(&run_id, &ctl);
        });
    }
}
