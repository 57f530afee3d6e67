//! Error types raised by the control core.

use thiserror::Error;

/// Errors from the per-session control machinery.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Non-fatal: the work-connection pool is at capacity and the incoming
    /// connection was discarded.
    #[error("work connection pool is full, discarding")]
    PoolFull,

    /// The control session has shut down; pending operations cannot finish.
    #[error("control session is closed")]
    Closed,

    /// No work connection arrived within the user-connection timeout.
    #[error("timeout trying to get work connection")]
    WorkConnTimeout,
}

/// Errors from proxy registration and operation.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy configuration: {0}")]
    ConfigInvalid(String),

    #[error("proxy name [{0}] is already in use")]
    NameTaken(String),

    #[error("exceed the max ports per client")]
    PortQuotaExceeded,

    #[error("proxy failed to run: {0}")]
    RunFailed(#[from] std::io::Error),
}

/// Errors raised by a plugin rejecting a message.
#[derive(Debug, Error)]
#[error("plugin [{plugin}] rejected the request: {reason}")]
pub struct PluginError {
    pub plugin: String,
    pub reason: String,
}

/// Render an error for the client: the full error when detailed reporting is
/// enabled, otherwise only the preconfigured summary.
pub fn response_error_string(
    summary: impl Into<String>,
    err: &impl std::fmt::Display,
    detailed: bool,
) -> String {
    if detailed {
        err.to_string()
    } else {
        summary.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_error_string_modes() {
        let err = ControlError::WorkConnTimeout;
        assert_eq!(
            response_error_string("summary", &err, true),
            "timeout trying to get work connection"
        );
        assert_eq!(response_error_string("summary", &err, false), "summary");
    }
}
