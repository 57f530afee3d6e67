//! Token authentication for control sessions.
//!
//! Both sides share a token. The client stamps each Login, Ping and
//! NewWorkConn with `(timestamp, privilege_key)` where
//! `privilege_key = md5_hex(token + timestamp)`; the server recomputes the
//! key and bounds the timestamp skew.

use md5::{Digest, Md5};
use thiserror::Error;

/// Maximum accepted distance between the peer's timestamp and local time.
const DEFAULT_MAX_SKEW_SECS: i64 = 900;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("authentication timestamp is out of range")]
    TimestampSkew,

    #[error("invalid privilege key")]
    InvalidKey,
}

/// Compute the privilege key for `token` at `timestamp`.
pub fn privilege_key(token: &str, timestamp: i64) -> String {
    let digest = Md5::digest(format!("{}{}", token, timestamp).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Client side: stamps outbound messages with fresh credentials.
#[derive(Debug, Clone)]
pub struct AuthSetter {
    token: String,
}

impl AuthSetter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Fresh `(timestamp, privilege_key)` pair for an outbound message.
    pub fn stamp(&self) -> (i64, String) {
        let now = unix_now();
        (now, privilege_key(&self.token, now))
    }
}

/// Server side: verifies credentials on inbound messages.
#[derive(Debug, Clone)]
pub struct AuthVerifier {
    token: String,
    max_skew_secs: i64,
}

impl AuthVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }

    pub fn with_max_skew_secs(mut self, secs: i64) -> Self {
        self.max_skew_secs = secs;
        self
    }

    pub fn verify(&self, key: &str, timestamp: i64) -> Result<(), AuthError> {
        if (unix_now() - timestamp).abs() > self.max_skew_secs {
            return Err(AuthError::TimestampSkew);
        }

        let expected = privilege_key(&self.token, timestamp);
        // Byte-wise compare over fixed-length hex; both sides are 32 chars.
        let mut diff = 0u8;
        for (a, b) in expected.bytes().zip(key.bytes()) {
            diff |= a ^ b;
        }
        if diff != 0 || expected.len() != key.len() {
            return Err(AuthError::InvalidKey);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setter_and_verifier_agree() {
        let setter = AuthSetter::new("secret");
        let verifier = AuthVerifier::new("secret");

        let (ts, key) = setter.stamp();
        assert!(verifier.verify(&key, ts).is_ok());
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let setter = AuthSetter::new("secret");
        let verifier = AuthVerifier::new("other");

        let (ts, key) = setter.stamp();
        assert_eq!(verifier.verify(&key, ts), Err(AuthError::InvalidKey));
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let verifier = AuthVerifier::new("secret").with_max_skew_secs(10);
        let stale = unix_now() - 60;
        let key = privilege_key("secret", stale);
        assert_eq!(verifier.verify(&key, stale), Err(AuthError::TimestampSkew));
    }

    #[test]
    fn test_key_is_deterministic_per_timestamp() {
        assert_eq!(privilege_key("t", 100), privilege_key("t", 100));
        assert_ne!(privilege_key("t", 100), privilege_key("t", 101));
    }

    #[test]
    fn test_truncated_key_is_rejected() {
        let verifier = AuthVerifier::new("secret");
        let ts = unix_now();
        let key = privilege_key("secret", ts);
        assert_eq!(
            verifier.verify(&key[..16], ts),
            Err(AuthError::InvalidKey)
        );
    }
}
