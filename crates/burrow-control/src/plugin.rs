//! Server plugin chain.
//!
//! Plugins observe or rewrite NewProxy and Ping messages before the control
//! session acts on them. A plugin error aborts the operation and is
//! reported to the client.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use burrow_proto::{NewProxy, Ping};

use crate::error::PluginError;

/// Identity of the client on whose behalf a message is processed.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub user: String,
    pub metas: HashMap<String, String>,
    pub run_id: String,
}

/// An interceptor in the server's plugin chain.
///
/// Default implementations pass messages through untouched, so a plugin only
/// overrides the hooks it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_new_proxy(
        &self,
        _user: &UserInfo,
        msg: NewProxy,
    ) -> Result<NewProxy, PluginError> {
        Ok(msg)
    }

    async fn on_ping(&self, _user: &UserInfo, msg: Ping) -> Result<Ping, PluginError> {
        Ok(msg)
    }
}

/// Ordered chain of plugins; each sees the previous plugin's output.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = plugin.name(), "registered server plugin");
        self.plugins.push(plugin);
    }

    pub async fn new_proxy(
        &self,
        user: &UserInfo,
        mut msg: NewProxy,
    ) -> Result<NewProxy, PluginError> {
        for plugin in &self.plugins {
            msg = plugin.on_new_proxy(user, msg).await?;
        }
        Ok(msg)
    }

    pub async fn ping(&self, user: &UserInfo, mut msg: Ping) -> Result<Ping, PluginError> {
        for plugin in &self.plugins {
            msg = plugin.on_ping(user, msg).await?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::ProxyType;

    struct RenamePlugin;

    #[async_trait]
    impl Plugin for RenamePlugin {
        fn name(&self) -> &str {
            "rename"
        }

        async fn on_new_proxy(
            &self,
            user: &UserInfo,
            mut msg: NewProxy,
        ) -> Result<NewProxy, PluginError> {
            msg.proxy_name = format!("{}.{}", user.user, msg.proxy_name);
            Ok(msg)
        }
    }

    struct RejectPlugin;

    #[async_trait]
    impl Plugin for RejectPlugin {
        fn name(&self) -> &str {
            "reject"
        }

        async fn on_ping(&self, _user: &UserInfo, _msg: Ping) -> Result<Ping, PluginError> {
            Err(PluginError {
                plugin: "reject".to_string(),
                reason: "not today".to_string(),
            })
        }
    }

    fn proxy_msg() -> NewProxy {
        NewProxy {
            proxy_name: "web".to_string(),
            proxy_type: ProxyType::Tcp,
            remote_port: 6000,
            use_encryption: false,
            use_compression: false,
        }
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let pm = PluginManager::new();
        let msg = pm
            .new_proxy(&UserInfo::default(), proxy_msg())
            .await
            .unwrap();
        assert_eq!(msg.proxy_name, "web");
    }

    #[tokio::test]
    async fn test_plugin_may_rewrite() {
        let mut pm = PluginManager::new();
        pm.register(Arc::new(RenamePlugin));
        let user = UserInfo {
            user: "alice".to_string(),
            ..Default::default()
        };
        let msg = pm.new_proxy(&user, proxy_msg()).await.unwrap();
        assert_eq!(msg.proxy_name, "alice.web");
    }

    #[tokio::test]
    async fn test_plugin_may_reject() {
        let mut pm = PluginManager::new();
        pm.register(Arc::new(RejectPlugin));
        let err = pm
            .ping(&UserInfo::default(), Ping::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not today"));
    }
}
