//! Client of the external registry ("adapter") service.
//!
//! The adapter persists client online/offline state outside the tunnel
//! server. Calls are fire-and-forget with a bounded in-flight count so an
//! unreachable adapter never stalls the control plane.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

const STATUS_ONLINE: &str = "online";
const STATUS_OFFLINE: &str = "offline";

const MAX_IN_FLIGHT: usize = 4;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AdapterClient {
    base_url: String,
    server_ip: String,
    http: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl AdapterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            server_ip: burrow_util::internal_ip().to_string(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            in_flight: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        }
    }

    /// Report a freshly registered proxy. Spawned, best-effort.
    pub fn notify_proxy_online(&self, unique_id: &str, mac_address: &str, remote_addr: &str) {
        let this = self.clone();
        let unique_id = unique_id.to_string();
        let mac_address = mac_address.to_string();
        let port = remote_addr.trim_start_matches(':').to_string();
        tokio::spawn(async move {
            let Ok(_permit) = this.in_flight.acquire().await else {
                return;
            };
            if let Err(e) = this.report_proxy_online(&unique_id, &mac_address, &port).await {
                info!("failed to update registry for client [{}]: {}", unique_id, e);
            }
        });
    }

    /// Mark a departed client offline. Spawned, best-effort.
    pub fn notify_client_offline(&self, unique_id: &str) {
        let this = self.clone();
        let unique_id = unique_id.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = this.in_flight.acquire().await else {
                return;
            };
            let form = [
                ("status", STATUS_OFFLINE.to_string()),
                ("unique_id", unique_id.clone()),
            ];
            match this
                .http
                .put(format!("{}/frp_update", this.base_url))
                .form(&form)
                .send()
                .await
            {
                Ok(resp) => debug!(
                    unique_id = %unique_id,
                    status = %resp.status(),
                    "registry notified of client offline"
                ),
                Err(e) => info!("failed to mark client [{}] offline: {}", unique_id, e),
            }
        });
    }

    /// Tell the registry this server is going away. Awaited by the signal
    /// handler before exit.
    pub async fn notify_server_exit(&self) {
        match self
            .http
            .put(format!("{}/nm_useless", self.base_url))
            .send()
            .await
        {
            Ok(resp) => info!(status = %resp.status(), "registry notified of server exit"),
            Err(e) => info!("failed to notify registry of server exit: {}", e),
        }
    }

    async fn report_proxy_online(
        &self,
        unique_id: &str,
        mac_address: &str,
        port: &str,
    ) -> Result<(), reqwest::Error> {
        // A re-registering client may have been assigned a new port after a
        // server restart, so fetch the stored record first and create or
        // update accordingly.
        let fetch_url = format!(
            "{}/frp_fetch/nodemaintenances-{}",
            self.base_url, unique_id
        );
        let body = self.http.get(fetch_url).send().await?.text().await?;

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        let error_code = json_string(parsed.pointer("/error/code"));

        let form = [
            ("frp_server_ip_address", self.server_ip.clone()),
            ("port", port.to_string()),
            ("unique_id", unique_id.to_string()),
            ("mac_address", mac_address.to_string()),
            ("status", STATUS_ONLINE.to_string()),
        ];

        match error_code.as_deref() {
            Some("404") => {
                // No record yet for this client.
                let resp = self
                    .http
                    .post(format!("{}/frp_create", self.base_url))
                    .form(&form)
                    .send()
                    .await?;
                debug!(unique_id = %unique_id, status = %resp.status(), "registry record created");
            }
            Some("400") => {
                info!(
                    "registry rejected fetch for [{}]: {}",
                    unique_id,
                    json_string(parsed.pointer("/message")).unwrap_or_default()
                );
            }
            _ => {
                let resp = self
                    .http
                    .put(format!("{}/frp_update", self.base_url))
                    .form(&form)
                    .send()
                    .await?;
                debug!(unique_id = %unique_id, status = %resp.status(), "registry record updated");
            }
        }
        Ok(())
    }
}

/// Stringify a JSON leaf the way loosely typed registries report codes:
/// both `"404"` and `404` are accepted.
fn json_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
