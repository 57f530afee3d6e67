//! Client-side peer of the server's control session.
//!
//! A [`ClientControl`] owns one logged-in control connection: it announces
//! the configured proxies, answers the server's work-connection demands,
//! sends heartbeat pings and fires a latch when the session is fully torn
//! down so the supervisor can reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use burrow_auth::AuthSetter;
use burrow_crypt::{derive_key, EncryptedReader, EncryptedWriter};
use burrow_mux::MuxSession;
use burrow_proto::{
    read_message, write_message, BoxedStream, CodecError, Message, NewProxy, NewWorkConn,
    StartWorkConn,
};
use burrow_util::Event;

use crate::config::{ClientConfig, ProxyConf, VisitorConf};
use crate::connector::Connector;
use crate::error::ClientError;

const SEND_QUEUE_CAPACITY: usize = 10;
const RECV_QUEUE_CAPACITY: usize = 10;
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Where a configured proxy stands on this session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyPhase {
    WaitStart,
    Running { remote_addr: String },
    Failed { reason: String },
}

pub struct ClientControl {
    run_id: String,
    cfg: Arc<ClientConfig>,
    auth: Arc<AuthSetter>,
    connector: Connector,
    /// Present when the session is multiplexed: work connections are opened
    /// as streams instead of fresh dials.
    session: Option<Arc<MuxSession>>,

    conn: Mutex<Option<BoxedStream>>,
    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    recv_tx: mpsc::Sender<Message>,
    recv_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    proxies: HashMap<String, ProxyConf>,
    visitors: HashMap<String, VisitorConf>,
    proxy_phases: Mutex<HashMap<String, ProxyPhase>>,

    last_pong: Mutex<Instant>,

    /// Teardown has begun; every task watches this.
    stop: Event,
    /// Teardown has finished; the supervisor waits on this.
    closed_done: Event,
}

impl ClientControl {
    pub fn new(
        cfg: Arc<ClientConfig>,
        auth: Arc<AuthSetter>,
        connector: Connector,
        conn: BoxedStream,
        session: Option<Arc<MuxSession>>,
        run_id: String,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);

        let proxies = cfg
            .proxies
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let visitors = cfg
            .visitors
            .iter()
            .map(|v| (v.name.clone(), v.clone()))
            .collect();

        Arc::new(Self {
            run_id,
            cfg,
            auth,
            connector,
            session,
            conn: Mutex::new(Some(conn)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            proxies,
            visitors,
            proxy_phases: Mutex::new(HashMap::new()),
            last_pong: Mutex::new(Instant::now()),
            stop: Event::new(),
            closed_done: Event::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    pub fn proxy_phase(&self, name: &str) -> Option<ProxyPhase> {
        self.proxy_phases.lock().unwrap().get(name).cloned()
    }

    /// Latch fired once every task of this control has exited.
    pub fn closed_done(&self) -> Event {
        self.closed_done.clone()
    }

    /// Begin teardown.
    pub fn close(&self) {
        self.stop.fire();
    }

    /// Spawn the control tasks: writer, reader and message handler.
    pub async fn run(self: &Arc<Self>) {
        let (send_rx, recv_rx, conn) = {
            let send_rx = self.send_rx.lock().unwrap().take();
            let recv_rx = self.recv_rx.lock().unwrap().take();
            let conn = self.conn.lock().unwrap().take();
            (send_rx, recv_rx, conn)
        };
        let (Some(send_rx), Some(recv_rx), Some(conn)) = (send_rx, recv_rx, conn) else {
            warn!("client control started twice, ignoring");
            return;
        };

        if !self.visitors.is_empty() {
            debug!(visitors = self.visitors.len(), "visitor endpoints registered");
        }

        let (read_half, write_half) = tokio::io::split(conn);

        let writer = tokio::spawn({
            let ctl = self.clone();
            async move { ctl.writer_loop(write_half, send_rx).await }
        });
        let reader = tokio::spawn({
            let ctl = self.clone();
            async move { ctl.reader_loop(read_half).await }
        });
        let handler = tokio::spawn({
            let ctl = self.clone();
            async move { ctl.handler_loop(recv_rx).await }
        });

        tokio::spawn({
            let ctl = self.clone();
            async move {
                for (name, task) in [("writer", writer), ("reader", reader), ("handler", handler)]
                {
                    if let Err(e) = task.await {
                        if e.is_panic() {
                            error!(task = name, "panic in client control task: {:?}", e);
                        }
                    }
                }
                ctl.closed_done.fire();
                debug!("client control closed");
            }
        });
    }

    async fn writer_loop(
        self: Arc<Self>,
        write_half: WriteHalf<BoxedStream>,
        mut send_rx: mpsc::Receiver<Message>,
    ) {
        let mut writer = EncryptedWriter::new(write_half, derive_key(&self.cfg.token));
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                msg = send_rx.recv() => match msg {
                    Some(msg) => {
                        trace!(kind = msg.kind(), "writing control message");
                        if let Err(e) = write_message(&mut writer, &msg).await {
                            warn!("write to control connection failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
        self.stop.fire();
    }

    async fn reader_loop(self: Arc<Self>, read_half: ReadHalf<BoxedStream>) {
        let mut reader = EncryptedReader::new(read_half, derive_key(&self.cfg.token));
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                res = read_message(&mut reader) => match res {
                    Ok(msg) => {
                        if self.recv_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(CodecError::ConnectionClosed) => {
                        info!("control connection closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("read from control connection failed: {}", e);
                        break;
                    }
                }
            }
        }
        self.stop.fire();
    }

    async fn handler_loop(self: Arc<Self>, mut recv_rx: mpsc::Receiver<Message>) {
        self.announce_proxies().await;

        let mut heartbeat_send =
            tokio::time::interval(Duration::from_secs(self.cfg.heartbeat_interval_secs));
        heartbeat_send.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_check = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        heartbeat_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                _ = heartbeat_send.tick() => {
                    let (timestamp, privilege_key) = self.auth.stamp();
                    let ping = Message::Ping(burrow_proto::Ping { privilege_key, timestamp });
                    if self.send_tx.send(ping).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat_check.tick() => {
                    let elapsed = self.last_pong.lock().unwrap().elapsed();
                    if elapsed > Duration::from_secs(self.cfg.heartbeat_timeout_secs) {
                        warn!("heartbeat timeout, no pong from server");
                        break;
                    }
                }
                msg = recv_rx.recv() => match msg {
                    Some(msg) => {
                        if !self.handle_message(msg).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        self.stop.fire();
    }

    /// Announce every configured proxy to the server.
    async fn announce_proxies(&self) {
        for conf in self.proxies.values() {
            let msg = Message::NewProxy(NewProxy {
                proxy_name: conf.name.clone(),
                proxy_type: conf.proxy_type,
                remote_port: conf.remote_port,
                use_encryption: false,
                use_compression: false,
            });
            self.proxy_phases
                .lock()
                .unwrap()
                .insert(conf.name.clone(), ProxyPhase::WaitStart);
            if self.send_tx.send(msg).await.is_err() {
                return;
            }
        }
    }

    /// Returns false when the session must end.
    async fn handle_message(self: &Arc<Self>, msg: Message) -> bool {
        match msg {
            Message::ReqWorkConn => {
                let ctl = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctl.handle_req_work_conn().await {
                        warn!("work connection failed: {}", e);
                    }
                });
                true
            }
            Message::Pong(pong) => {
                if !pong.error.is_empty() {
                    error!("pong contains error: {}", pong.error);
                    return false;
                }
                *self.last_pong.lock().unwrap() = Instant::now();
                debug!("receive heartbeat from server");
                true
            }
            Message::NewProxyResp(resp) => {
                let phase = if resp.error.is_empty() {
                    info!(proxy = %resp.proxy_name, addr = %resp.remote_addr, "proxy started");
                    ProxyPhase::Running {
                        remote_addr: resp.remote_addr,
                    }
                } else {
                    warn!(proxy = %resp.proxy_name, "proxy start error: {}", resp.error);
                    ProxyPhase::Failed { reason: resp.error }
                };
                self.proxy_phases
                    .lock()
                    .unwrap()
                    .insert(resp.proxy_name, phase);
                true
            }
            other => {
                trace!(kind = other.kind(), "ignoring control message");
                true
            }
        }
    }

    /// The server demanded a work connection: dial one, register it, then
    /// sit in the server's pool until a user connection claims it.
    async fn handle_req_work_conn(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut work_conn = self.new_work_conn().await?;

        let (timestamp, privilege_key) = self.auth.stamp();
        let hello = Message::NewWorkConn(NewWorkConn {
            run_id: self.run_id.clone(),
            privilege_key,
            timestamp,
        });
        write_message(&mut work_conn, &hello).await?;

        // Blocks until the server pairs this conn with a user connection.
        let start = match read_message(&mut work_conn).await {
            Ok(Message::StartWorkConn(start)) => start,
            Ok(other) => {
                debug!(kind = other.kind(), "unexpected message on work connection");
                return Ok(());
            }
            Err(CodecError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        self.serve_work_conn(work_conn, start).await
    }

    async fn new_work_conn(&self) -> Result<BoxedStream, ClientError> {
        match &self.session {
            Some(session) => Ok(Box::new(session.open_stream()?)),
            None => self.connector.connect().await,
        }
    }

    async fn serve_work_conn(
        &self,
        mut work_conn: BoxedStream,
        start: StartWorkConn,
    ) -> Result<(), ClientError> {
        let Some(conf) = self.proxies.get(&start.proxy_name) else {
            warn!(proxy = %start.proxy_name, "work connection for unknown proxy");
            return Ok(());
        };

        let mut local = tokio::net::TcpStream::connect(conf.local_addr()).await?;
        debug!(
            proxy = %start.proxy_name,
            src = %start.src_addr,
            "relaying user connection to local service"
        );

        match tokio::io::copy_bidirectional(&mut local, &mut work_conn).await {
            Ok((to_server, to_local)) => {
                debug!(proxy = %start.proxy_name, to_server, to_local, "work connection finished");
            }
            Err(e) => debug!(proxy = %start.proxy_name, "relay ended: {}", e),
        }
        Ok(())
    }
}
