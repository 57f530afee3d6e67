//! Per-client control session.
//!
//! Each connected client is owned by one [`Control`] running four
//! cooperating tasks over the control connection:
//!
//! * **writer** — sends the login response plaintext, then drains the send
//!   queue through the encrypting wrapper in FIFO order;
//! * **reader** — decrypts inbound frames and forwards them to the recv
//!   queue;
//! * **manager** — dispatches inbound messages and enforces the heartbeat
//!   deadline on a one-second ticker;
//! * **stopper** — waits for shutdown to start and tears everything down in
//!   a fixed order: recv queue, send queue, connection, work-conn pool,
//!   proxies.
//!
//! The session also owns the work-connection pool the client pre-dials, and
//! the registry of proxies announced over this session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, error, info, trace, warn};

use burrow_crypt::{derive_key, EncryptedReader, EncryptedWriter};
use burrow_proto::{
    read_message, write_message, BoxedStream, CodecError, Login, LoginResp, Message, NewProxy,
    NewProxyResp, Ping, Pong,
};
use burrow_util::{Event, Shutdown};

use crate::error::{response_error_string, ControlError, ProxyError};
use crate::plugin::UserInfo;
use crate::proxy::{create_proxy, Proxy, ProxyInfo, WorkConnFetcher};
use crate::ServerResources;

/// Extra work-connection pool capacity beyond the steady-state size.
/// Not derived from any tunable; inherited as-is.
const POOL_SLACK: usize = 10;

const SEND_QUEUE_CAPACITY: usize = 10;
const RECV_QUEUE_CAPACITY: usize = 10;

/// Period of the manager's heartbeat-deadline check.
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Working,
    Closed,
}

/// State mutated only under the control's exclusive lock.
struct Guarded {
    proxies: HashMap<String, Box<dyn Proxy>>,
    ports_used_num: u64,
    status: ControlStatus,
}

pub struct Control {
    res: Arc<ServerResources>,
    login: Login,
    pool_count: usize,

    /// Session identity; cleared when this control is replaced so a late
    /// deregistration cannot remove the successor.
    run_id: Mutex<String>,

    conn: Mutex<Option<BoxedStream>>,

    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    recv_tx: mpsc::Sender<Message>,
    recv_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    pool_tx: mpsc::Sender<BoxedStream>,
    pool_rx: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,

    guarded: Mutex<Guarded>,
    last_ping: Mutex<Instant>,

    reader_done: Shutdown,
    writer_done: Shutdown,
    manager_done: Shutdown,
    all_shutdown: Shutdown,

    recv_closed: Event,
    send_closed: Event,
    conn_closed: Event,
}

impl Control {
    pub fn new(
        res: Arc<ServerResources>,
        conn: BoxedStream,
        login: Login,
        run_id: String,
    ) -> Arc<Self> {
        let pool_count = login.pool_count.min(res.cfg.max_pool_count);

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
        let (pool_tx, pool_rx) = mpsc::channel(pool_count + POOL_SLACK);

        Arc::new(Self {
            res,
            login,
            pool_count,
            run_id: Mutex::new(run_id),
            conn: Mutex::new(Some(conn)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            pool_tx,
            pool_rx: tokio::sync::Mutex::new(pool_rx),
            guarded: Mutex::new(Guarded {
                proxies: HashMap::new(),
                ports_used_num: 0,
                status: ControlStatus::Working,
            }),
            last_ping: Mutex::new(Instant::now()),
            reader_done: Shutdown::new(),
            writer_done: Shutdown::new(),
            manager_done: Shutdown::new(),
            all_shutdown: Shutdown::new(),
            recv_closed: Event::new(),
            send_closed: Event::new(),
            conn_closed: Event::new(),
        })
    }

    pub fn run_id(&self) -> String {
        self.run_id.lock().unwrap().clone()
    }

    pub fn status(&self) -> ControlStatus {
        self.guarded.lock().unwrap().status
    }

    pub fn ports_used_num(&self) -> u64 {
        self.guarded.lock().unwrap().ports_used_num
    }

    pub fn pool_count(&self) -> usize {
        self.pool_count
    }

    /// Launch the session: reply to the login and start the four tasks.
    pub async fn start(self: &Arc<Self>) {
        let (send_rx, recv_rx, conn) = {
            let send_rx = self.send_rx.lock().unwrap().take();
            let recv_rx = self.recv_rx.lock().unwrap().take();
            let conn = self.conn.lock().unwrap().take();
            (send_rx, recv_rx, conn)
        };
        let (Some(send_rx), Some(recv_rx), Some(conn)) = (send_rx, recv_rx, conn) else {
            warn!("control started twice, ignoring");
            return;
        };

        let (read_half, write_half) = tokio::io::split(conn);

        self.spawn_guarded("writer", self.writer_done.clone(), {
            let ctl = self.clone();
            async move { ctl.writer_loop(write_half, send_rx).await }
        });

        // Prime the pool: demand the steady-state number of work conns.
        for _ in 0..self.pool_count {
            let _ = self.send_tx.send(Message::ReqWorkConn).await;
        }

        self.spawn_guarded("manager", self.manager_done.clone(), {
            let ctl = self.clone();
            async move { ctl.manager_loop(recv_rx).await }
        });

        self.spawn_guarded("reader", self.reader_done.clone(), {
            let ctl = self.clone();
            async move { ctl.reader_loop(read_half).await }
        });

        tokio::spawn({
            let ctl = self.clone();
            async move {
                let inner = tokio::spawn(ctl.clone().stopper_loop());
                if let Err(e) = inner.await {
                    if e.is_panic() {
                        error!(task = "stopper", "panic in control task: {:?}", e);
                    }
                }
            }
        });
    }

    /// Spawn a task whose exit (normal or panic) always starts the shutdown
    /// sequence and completes its done-latch.
    fn spawn_guarded<F>(self: &Arc<Self>, name: &'static str, done: Shutdown, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let ctl = self.clone();
        tokio::spawn(async move {
            let inner = tokio::spawn(fut);
            if let Err(e) = inner.await {
                if e.is_panic() {
                    error!(task = name, "panic in control task: {:?}", e);
                }
            }
            ctl.all_shutdown.start();
            done.done();
        });
    }

    /// Put an incoming work connection into the pool without blocking.
    ///
    /// A full pool rejects (and thereby closes) the connection: a flooding
    /// client cannot grow server memory past `pool_count + POOL_SLACK`.
    pub fn register_work_conn(&self, conn: BoxedStream) -> Result<(), ControlError> {
        match self.pool_tx.try_send(conn) {
            Ok(()) => {
                debug!("new work connection registered");
                Ok(())
            }
            Err(TrySendError::Full(conn)) => {
                drop(conn);
                debug!("work connection pool is full, discarding");
                Err(ControlError::PoolFull)
            }
            Err(TrySendError::Closed(conn)) => {
                drop(conn);
                Err(ControlError::Closed)
            }
        }
    }

    /// Take a work connection for a user connection, demanding more from
    /// the client as needed.
    pub async fn get_work_conn(&self) -> Result<BoxedStream, ControlError> {
        let mut pool = self.pool_rx.lock().await;

        match pool.try_recv() {
            Ok(conn) => {
                debug!("get work connection from pool");
                self.replenish_pool();
                return Ok(conn);
            }
            Err(TryRecvError::Disconnected) => return Err(ControlError::Closed),
            Err(TryRecvError::Empty) => {}
        }

        // Pool empty: demand one, then wait bounded by the user-conn timeout.
        if self.send_tx.send(Message::ReqWorkConn).await.is_err() {
            return Err(ControlError::Closed);
        }

        tokio::select! {
            conn = pool.recv() => match conn {
                Some(conn) => {
                    self.replenish_pool();
                    Ok(conn)
                }
                None => {
                    warn!("no work connections available, control closed");
                    Err(ControlError::Closed)
                }
            },
            _ = self.all_shutdown.wait_start() => Err(ControlError::Closed),
            _ = tokio::time::sleep(Duration::from_secs(self.res.cfg.user_conn_timeout_secs)) => {
                warn!("timeout trying to get work connection");
                Err(ControlError::WorkConnTimeout)
            }
        }
    }

    /// Ask the client for one replacement work connection. Best-effort: a
    /// send queue whose writer has exited turns this into a no-op rather
    /// than an error for the caller.
    fn replenish_pool(&self) {
        let tx = self.send_tx.clone();
        tokio::spawn(async move {
            if tx.send(Message::ReqWorkConn).await.is_err() {
                trace!("replenish skipped, send queue closed");
            }
        });
    }

    /// Called when a later login reuses this session's run id: give up the
    /// identity and begin teardown.
    pub fn replaced(&self, new_ctl: &Arc<Control>) {
        info!(new_run_id = %new_ctl.run_id(), "replaced by new client");
        self.run_id.lock().unwrap().clear();
        self.all_shutdown.start();
    }

    /// Explicitly terminate the session.
    pub fn close(&self) {
        self.all_shutdown.start();
    }

    /// Block until the stopper has finished tearing the session down.
    pub async fn wait_closed(&self) {
        self.all_shutdown.wait_done().await;
    }

    fn user_info(&self) -> UserInfo {
        UserInfo {
            user: self.login.user.clone(),
            metas: self.login.metas.clone(),
            run_id: self.run_id(),
        }
    }

    fn work_conn_fetcher(self: &Arc<Self>) -> WorkConnFetcher {
        let ctl: Weak<Control> = Arc::downgrade(self);
        Arc::new(move || {
            let ctl = ctl.clone();
            Box::pin(async move {
                match ctl.upgrade() {
                    Some(ctl) => ctl.get_work_conn().await,
                    None => Err(ControlError::Closed),
                }
            })
        })
    }

    /// Validate, build and launch a proxy for an announcement; returns the
    /// public address.
    pub async fn register_proxy(self: &Arc<Self>, msg: &NewProxy) -> Result<String, ProxyError> {
        if msg.proxy_name.is_empty() {
            return Err(ProxyError::ConfigInvalid("proxy name is empty".to_string()));
        }
        if let Some(allowed) = self.res.cfg.allowed_ports()? {
            if msg.remote_port != 0 && !allowed.contains(&u64::from(msg.remote_port)) {
                return Err(ProxyError::ConfigInvalid(format!(
                    "port [{}] is not allowed",
                    msg.remote_port
                )));
            }
        }

        let mut pxy = create_proxy(
            msg,
            self.res.cfg.proxy_bind_addr.clone(),
            self.work_conn_fetcher(),
        )?;

        // Reserve port quota before binding; released again on any failure.
        let quota_active = self.res.cfg.max_ports_per_client > 0;
        if quota_active {
            let mut guarded = self.guarded.lock().unwrap();
            if guarded.ports_used_num + pxy.used_ports_num() > self.res.cfg.max_ports_per_client {
                return Err(ProxyError::PortQuotaExceeded);
            }
            guarded.ports_used_num += pxy.used_ports_num();
        }

        let release_quota = |ports: u64| {
            if quota_active {
                self.guarded.lock().unwrap().ports_used_num -= ports;
            }
        };

        let remote_addr = match pxy.run().await {
            Ok(addr) => addr,
            Err(e) => {
                release_quota(pxy.used_ports_num());
                return Err(e);
            }
        };

        let info = ProxyInfo {
            proxy_type: msg.proxy_type,
            run_id: self.run_id(),
        };
        if let Err(e) = self.res.proxy_manager.add(pxy.name(), info) {
            pxy.close();
            release_quota(pxy.used_ports_num());
            return Err(e);
        }

        self.guarded
            .lock()
            .unwrap()
            .proxies
            .insert(pxy.name().to_string(), pxy);

        Ok(remote_addr)
    }

    /// Shut down one proxy by name; unknown names are ignored.
    pub fn close_proxy(&self, proxy_name: &str) {
        let closed_type = {
            let mut guarded = self.guarded.lock().unwrap();
            match guarded.proxies.remove(proxy_name) {
                Some(pxy) => {
                    if self.res.cfg.max_ports_per_client > 0 {
                        guarded.ports_used_num -= pxy.used_ports_num();
                    }
                    pxy.close();
                    self.res.proxy_manager.del(pxy.name());
                    Some(pxy.proxy_type())
                }
                None => None,
            }
        };

        if let Some(proxy_type) = closed_type {
            self.res.metrics.close_proxy(proxy_type.as_str());
        }
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut write_half: WriteHalf<BoxedStream>,
        mut send_rx: mpsc::Receiver<Message>,
    ) {
        // The login response goes out before the encrypted wrapper exists:
        // the client only switches to its decryptor after reading it.
        let resp = Message::LoginResp(LoginResp {
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: self.run_id(),
            server_udp_port: self.res.cfg.bind_udp_port,
            error: String::new(),
        });
        if let Err(e) = write_message(&mut write_half, &resp).await {
            warn!("failed to send login response: {}", e);
            return;
        }

        let mut writer = EncryptedWriter::new(write_half, derive_key(&self.res.cfg.token));
        loop {
            tokio::select! {
                _ = self.send_closed.wait() => {
                    // Queue closed by the stopper: flush what is buffered.
                    while let Ok(msg) = send_rx.try_recv() {
                        if write_message(&mut writer, &msg).await.is_err() {
                            break;
                        }
                    }
                    info!("control writer is closing");
                    break;
                }
                msg = send_rx.recv() => match msg {
                    Some(msg) => {
                        trace!(kind = msg.kind(), "writing control message");
                        if let Err(e) = write_message(&mut writer, &msg).await {
                            warn!("write message to control connection error: {}", e);
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
    }

    async fn reader_loop(self: Arc<Self>, read_half: ReadHalf<BoxedStream>) {
        let mut reader = EncryptedReader::new(read_half, derive_key(&self.res.cfg.token));
        loop {
            tokio::select! {
                _ = self.conn_closed.wait() => {
                    debug!("control connection closed");
                    return;
                }
                res = read_message(&mut reader) => match res {
                    Ok(msg) => {
                        if self.recv_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(CodecError::ConnectionClosed) => {
                        debug!("control connection closed");
                        return;
                    }
                    Err(e) => {
                        warn!("read error on control connection: {}", e);
                        return;
                    }
                }
            }
        }
    }

    async fn manager_loop(self: Arc<Self>, mut recv_rx: mpsc::Receiver<Message>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.recv_closed.wait() => {
                    // Queue closed by the stopper: handle what is buffered.
                    while let Ok(msg) = recv_rx.try_recv() {
                        if !self.handle_message(msg).await {
                            return;
                        }
                    }
                    return;
                }
                _ = heartbeat.tick() => {
                    let elapsed = self.last_ping.lock().unwrap().elapsed();
                    if elapsed > Duration::from_secs(self.res.cfg.heartbeat_timeout_secs) {
                        warn!("heartbeat timeout");
                        return;
                    }
                }
                msg = recv_rx.recv() => match msg {
                    Some(msg) => {
                        if !self.handle_message(msg).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }

    /// Dispatch one inbound message; returns false when the session must
    /// end.
    async fn handle_message(self: &Arc<Self>, msg: Message) -> bool {
        match msg {
            Message::NewProxy(msg) => {
                self.handle_new_proxy(msg).await;
                true
            }
            Message::CloseProxy(msg) => {
                self.close_proxy(&msg.proxy_name);
                info!(proxy = %msg.proxy_name, "close proxy success");
                true
            }
            Message::Ping(ping) => self.handle_ping(ping).await,
            other => {
                // Unrecognized kinds are ignored for forward compatibility.
                trace!(kind = other.kind(), "ignoring control message");
                true
            }
        }
    }

    async fn handle_new_proxy(self: &Arc<Self>, msg: NewProxy) {
        let proxy_name = msg.proxy_name.clone();
        let user = self.user_info();

        let result = match self.res.plugins.new_proxy(&user, msg).await {
            Ok(msg) => self
                .register_proxy(&msg)
                .await
                .map(|addr| (msg, addr))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let mut resp = NewProxyResp {
            proxy_name: proxy_name.clone(),
            ..Default::default()
        };
        match result {
            Ok((msg, remote_addr)) => {
                info!(proxy = %msg.proxy_name, addr = %remote_addr, "new proxy success");
                resp.proxy_name = msg.proxy_name.clone();
                resp.remote_addr = remote_addr.clone();
                self.res.metrics.new_proxy(msg.proxy_type.as_str());
                if let Some(adapter) = &self.res.adapter {
                    adapter.notify_proxy_online(
                        &self.login.unique_id,
                        &self.login.mac_address,
                        &remote_addr,
                    );
                }
            }
            Err(e) => {
                warn!(proxy = %proxy_name, "new proxy error: {}", e);
                resp.error = response_error_string(
                    format!("new proxy [{}] error", proxy_name),
                    &e,
                    self.res.cfg.detailed_errors_to_client,
                );
            }
        }
        let _ = self.send_tx.send(Message::NewProxyResp(resp)).await;
    }

    /// Returns false when the ping is invalid and the session must end.
    async fn handle_ping(&self, ping: Ping) -> bool {
        let user = self.user_info();
        let failure = match self.res.plugins.ping(&user, ping).await {
            Ok(ping) => self
                .res
                .auth
                .verify(&ping.privilege_key, ping.timestamp)
                .err()
                .map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(err) = failure {
            warn!("received invalid ping: {}", err);
            let pong = Pong {
                error: response_error_string(
                    "invalid ping",
                    &err,
                    self.res.cfg.detailed_errors_to_client,
                ),
            };
            let _ = self.send_tx.send(Message::Pong(pong)).await;
            return false;
        }

        *self.last_ping.lock().unwrap() = Instant::now();
        debug!("receive heartbeat");
        let _ = self.send_tx.send(Message::Pong(Pong::default())).await;
        true
    }

    async fn stopper_loop(self: Arc<Self>) {
        self.all_shutdown.wait_start().await;

        // Fixed order: recv queue, send queue, connection. The manager
        // drains and exits before the writer goes away, so nothing enqueues
        // a response into a dead queue.
        self.recv_closed.fire();
        self.manager_done.wait_done().await;

        self.send_closed.fire();
        self.writer_done.wait_done().await;

        self.conn_closed.fire();
        self.reader_done.wait_done().await;

        {
            let mut pool = self.pool_rx.lock().await;
            pool.close();
            while let Ok(conn) = pool.try_recv() {
                drop(conn);
            }
        }

        let drained: Vec<(String, Box<dyn Proxy>)> = {
            let mut guarded = self.guarded.lock().unwrap();
            guarded.status = ControlStatus::Closed;
            guarded.proxies.drain().collect()
        };
        for (name, pxy) in drained {
            pxy.close();
            self.res.proxy_manager.del(&name);
            self.res.metrics.close_proxy(pxy.proxy_type().as_str());
        }

        self.all_shutdown.done();
        info!("client exit success");
        self.res.metrics.close_client();
        if let Some(adapter) = &self.res.adapter {
            adapter.notify_client_offline(&self.login.unique_id);
        }
    }
}
