//! Session supervisor: login, reconnection with a sliding-window backoff
//! and transparent controller replacement.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use burrow_auth::AuthSetter;
use burrow_mux::MuxSession;
use burrow_proto::{read_message, write_message, BoxedStream, Login, LoginResp, Message};
use burrow_util::Event;

use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::control::ClientControl;
use crate::error::ClientError;

const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_RETRY_SLEEP: Duration = Duration::from_secs(10);

/// Reconnection schedule.
///
/// Two interacting policies: the outer cadence between dead sessions (first
/// three reconnects are immediate, then a doubling delay, all reset by a
/// one-minute sliding window) and the inner delay between failed login
/// attempts (1s doubling, capped at 20s, reset on success).
#[derive(Debug)]
pub struct ReconnectPolicy {
    login_delay: Duration,
    reconnect_delay: Duration,
    reconnect_counts: u32,
    cutoff: Instant,
}

impl ReconnectPolicy {
    const MAX_LOGIN_DELAY: Duration = Duration::from_secs(20);
    const WINDOW: Duration = Duration::from_secs(60);
    const FREE_RETRIES: u32 = 3;

    pub fn new(now: Instant) -> Self {
        Self {
            login_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            reconnect_counts: 1,
            cutoff: now + Self::WINDOW,
        }
    }

    /// How long to sleep before the next reconnect attempt.
    pub fn before_reconnect(&mut self) -> Duration {
        let delay = if self.reconnect_counts > Self::FREE_RETRIES {
            let delay = self.reconnect_delay;
            self.reconnect_delay *= 2;
            delay
        } else {
            Duration::ZERO
        };
        self.reconnect_counts += 1;
        delay
    }

    /// Reset the cadence once a minute has passed since the window opened,
    /// so an extended outage does not leave the backoff pinned forever.
    pub fn roll_window(&mut self, now: Instant) {
        if now > self.cutoff {
            self.cutoff = now + Self::WINDOW;
            self.reconnect_delay = Duration::from_secs(1);
            self.reconnect_counts = 1;
        }
    }

    /// How long to sleep after a failed login attempt.
    pub fn after_login_failure(&mut self) -> Duration {
        let delay = self.login_delay;
        self.login_delay = (self.login_delay * 2).min(Self::MAX_LOGIN_DELAY);
        delay
    }

    pub fn after_login_success(&mut self) {
        self.login_delay = Duration::from_secs(1);
    }
}

/// Owns at most one live [`ClientControl`] and keeps it working.
pub struct ClientService {
    cfg: Arc<ClientConfig>,
    auth: Arc<AuthSetter>,
    connector: Connector,

    /// Assigned by the server on first login, reused to reclaim the session.
    run_id: Mutex<String>,
    server_udp_port: Mutex<u16>,

    ctl: RwLock<Option<Arc<ClientControl>>>,

    /// 0 while running; set before close so the supervisor stops.
    exit: AtomicU32,
    cancel: Event,
}

impl ClientService {
    pub fn new(cfg: ClientConfig) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        Arc::new(Self {
            auth: Arc::new(AuthSetter::new(cfg.token.clone())),
            connector: Connector::new(cfg.clone()),
            run_id: Mutex::new(String::new()),
            server_udp_port: Mutex::new(0),
            ctl: RwLock::new(None),
            exit: AtomicU32::new(0),
            cancel: Event::new(),
            cfg,
        })
    }

    pub fn controller(&self) -> Option<Arc<ClientControl>> {
        self.ctl.read().unwrap().clone()
    }

    pub fn server_udp_port(&self) -> u16 {
        *self.server_udp_port.lock().unwrap()
    }

    /// Log in, hand the connection to a controller and supervise it until
    /// [`close`](Self::close) is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        loop {
            match self.login().await {
                Ok((conn, session)) => {
                    let ctl = self.new_control(conn, session);
                    ctl.run().await;
                    *self.ctl.write().unwrap() = Some(ctl);
                    break;
                }
                Err(e) => {
                    warn!("login to server failed: {}", e);
                    if self.cfg.login_fail_exit {
                        return Err(e);
                    }
                    tokio::time::sleep(LOGIN_RETRY_SLEEP).await;
                }
            }
        }

        let svc = self.clone();
        tokio::spawn(async move { svc.keep_controller_working().await });

        self.cancel.wait().await;
        Ok(())
    }

    /// Stop the service: mark exit, close the controller, release `run`.
    pub fn close(&self) {
        self.exit.store(1, Ordering::SeqCst);
        if let Some(ctl) = self.controller() {
            ctl.close();
        }
        self.cancel.fire();
    }

    fn new_control(
        self: &Arc<Self>,
        conn: BoxedStream,
        session: Option<Arc<MuxSession>>,
    ) -> Arc<ClientControl> {
        ClientControl::new(
            self.cfg.clone(),
            self.auth.clone(),
            self.connector.clone(),
            conn,
            session,
            self.run_id.lock().unwrap().clone(),
        )
    }

    /// Establish one control connection and complete the login exchange.
    async fn login(&self) -> Result<(BoxedStream, Option<Arc<MuxSession>>), ClientError> {
        let raw = self.connector.connect().await?;

        // With multiplexing the initial stream carries the control channel
        // for the rest of the session; work conns become further streams.
        let (mut conn, session): (BoxedStream, Option<Arc<MuxSession>>) = if self.cfg.tcp_mux {
            let session = MuxSession::client(raw);
            let stream = session.open_stream()?;
            (Box::new(stream), Some(session))
        } else {
            (raw, None)
        };

        let (timestamp, privilege_key) = self.auth.stamp();
        let login = Login {
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            user: self.cfg.user.clone(),
            pool_count: self.cfg.pool_count,
            run_id: self.run_id.lock().unwrap().clone(),
            metas: self.cfg.metas.clone(),
            unique_id: burrow_util::unique_id(),
            mac_address: burrow_util::primary_mac().unwrap_or_default(),
            privilege_key,
            timestamp,
        };
        write_message(&mut conn, &Message::Login(login)).await?;

        let resp = match tokio::time::timeout(LOGIN_READ_TIMEOUT, read_message(&mut conn)).await {
            Err(_) => return Err(ClientError::LoginTimeout),
            Ok(res) => res?,
        };
        let resp: LoginResp = match resp {
            Message::LoginResp(resp) => resp,
            other => {
                return Err(ClientError::LoginRejected(format!(
                    "unexpected {} in response to login",
                    other.kind()
                )))
            }
        };
        if !resp.error.is_empty() {
            return Err(ClientError::LoginRejected(resp.error));
        }

        *self.run_id.lock().unwrap() = resp.run_id.clone();
        *self.server_udp_port.lock().unwrap() = resp.server_udp_port;
        info!(
            run_id = %resp.run_id,
            server_udp_port = resp.server_udp_port,
            "login to server success"
        );
        Ok((conn, session))
    }

    /// Reconnect whenever the live controller dies, following the
    /// [`ReconnectPolicy`] schedule.
    async fn keep_controller_working(self: Arc<Self>) {
        let mut policy = ReconnectPolicy::new(Instant::now());

        loop {
            let Some(ctl) = self.controller() else { return };
            ctl.closed_done().wait().await;
            if self.exit.load(Ordering::SeqCst) != 0 {
                return;
            }

            let delay = policy.before_reconnect();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            policy.roll_window(Instant::now());

            loop {
                info!("try to reconnect to server...");
                match self.login().await {
                    Err(e) => {
                        warn!("reconnect to server error: {}", e);
                        tokio::time::sleep(policy.after_login_failure()).await;
                    }
                    Ok((conn, session)) => {
                        policy.after_login_success();
                        let ctl = self.new_control(conn, session);
                        ctl.run().await;
                        let old = self.ctl.write().unwrap().replace(ctl);
                        if let Some(old) = old {
                            old.close();
                        }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_three_reconnects_are_free() {
        let mut policy = ReconnectPolicy::new(Instant::now());
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::from_secs(1));
        assert_eq!(policy.before_reconnect(), Duration::from_secs(2));
        assert_eq!(policy.before_reconnect(), Duration::from_secs(4));
    }

    #[test]
    fn test_window_resets_cadence() {
        let start = Instant::now();
        let mut policy = ReconnectPolicy::new(start);
        for _ in 0..6 {
            policy.before_reconnect();
        }
        // More than a minute later the schedule starts over.
        policy.roll_window(start + Duration::from_secs(61));
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::ZERO);
        assert_eq!(policy.before_reconnect(), Duration::from_secs(1));
    }

    #[test]
    fn test_window_does_not_reset_early() {
        let start = Instant::now();
        let mut policy = ReconnectPolicy::new(start);
        for _ in 0..5 {
            policy.before_reconnect();
        }
        policy.roll_window(start + Duration::from_secs(30));
        // Still inside the window: the doubling continues.
        assert_eq!(policy.before_reconnect(), Duration::from_secs(4));
    }

    #[test]
    fn test_login_delay_doubles_and_caps() {
        let mut policy = ReconnectPolicy::new(Instant::now());
        let delays: Vec<u64> = (0..7)
            .map(|_| policy.after_login_failure().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 20, 20]);

        policy.after_login_success();
        assert_eq!(policy.after_login_failure(), Duration::from_secs(1));
    }
}
