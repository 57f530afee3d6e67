//! In-process counters for connected clients and running proxies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Server-wide counters, updated by control sessions as clients and proxies
/// come and go.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    client_count: AtomicI64,
    proxy_counts: Mutex<HashMap<String, i64>>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_client(&self) {
        self.client_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_client(&self) {
        self.client_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn new_proxy(&self, proxy_type: &str) {
        let mut counts = self.proxy_counts.lock().unwrap();
        *counts.entry(proxy_type.to_string()).or_insert(0) += 1;
    }

    pub fn close_proxy(&self, proxy_type: &str) {
        let mut counts = self.proxy_counts.lock().unwrap();
        *counts.entry(proxy_type.to_string()).or_insert(0) -= 1;
    }

    pub fn client_count(&self) -> i64 {
        self.client_count.load(Ordering::Relaxed)
    }

    pub fn proxy_count(&self, proxy_type: &str) -> i64 {
        self.proxy_counts
            .lock()
            .unwrap()
            .get(proxy_type)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_counter() {
        let m = ServerMetrics::new();
        m.new_client();
        m.new_client();
        m.close_client();
        assert_eq!(m.client_count(), 1);
    }

    #[test]
    fn test_proxy_counter_per_type() {
        let m = ServerMetrics::new();
        m.new_proxy("tcp");
        m.new_proxy("tcp");
        m.new_proxy("udp");
        m.close_proxy("tcp");
        assert_eq!(m.proxy_count("tcp"), 1);
        assert_eq!(m.proxy_count("udp"), 1);
        assert_eq!(m.proxy_count("http"), 0);
    }
}
