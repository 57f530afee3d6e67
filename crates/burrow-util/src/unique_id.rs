//! Deterministic host identity derived from physical MAC addresses.
//!
//! The id must be stable across restarts and interface reordering on the
//! same host: virtual interfaces are excluded, the numerically smallest
//! hardware address is selected, and the id is the tail of a SHA-1 over its
//! decimal representation.

use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const SYS_CLASS_NET: &str = "/sys/class/net";
const SYS_VIRTUAL_NET: &str = "/sys/devices/virtual/net";

/// Length of the returned id in hex characters.
const ID_LEN: usize = 20;

/// Deterministic lowercase-hex host id, [`ID_LEN`] characters.
///
/// Hosts without readable physical interfaces (non-Linux, containers with a
/// masked sysfs) fall back to hashing the hostname, preserving the
/// per-host determinism contract.
pub fn unique_id() -> String {
    match min_physical_mac() {
        Some(mac) => hash_tail(&mac.to_string()),
        None => {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string());
            debug!(host = %host, "no physical mac found, deriving id from hostname");
            hash_tail(&host)
        }
    }
}

/// The hardware address the id is derived from, colon-separated, for
/// reporting alongside the id.
pub fn primary_mac() -> Option<String> {
    let (name, _) = physical_macs()
        .into_iter()
        .min_by_key(|(_, value)| *value)?;
    read_mac(&name)
}

fn min_physical_mac() -> Option<u64> {
    physical_macs().into_iter().map(|(_, value)| value).min()
}

/// All (interface name, numeric MAC) pairs for non-virtual interfaces.
fn physical_macs() -> Vec<(String, u64)> {
    let virtuals = virtual_interface_names();

    let Ok(entries) = std::fs::read_dir(SYS_CLASS_NET) else {
        return Vec::new();
    };

    let mut macs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if virtuals.contains(&name) {
            continue;
        }
        let Some(addr) = read_mac(&name) else {
            continue;
        };
        if let Some(value) = parse_mac(&addr) {
            macs.push((name, value));
        }
    }
    macs
}

/// Names under the virtual-interface directory; best-effort, an unreadable
/// listing excludes nothing.
fn virtual_interface_names() -> HashSet<String> {
    let mut names = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(SYS_VIRTUAL_NET) {
        for entry in entries.flatten() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names
}

fn read_mac(interface: &str) -> Option<String> {
    let path = Path::new(SYS_CLASS_NET).join(interface).join("address");
    let addr = std::fs::read_to_string(path).ok()?;
    let addr = addr.trim().to_string();
    if addr.is_empty() || addr == "00:00:00:00:00:00" {
        return None;
    }
    Some(addr)
}

/// Strip separators and parse the hardware address as a hex integer.
fn parse_mac(addr: &str) -> Option<u64> {
    let hex: String = addr.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.is_empty() {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok()
}

/// Last [`ID_LEN`] hex characters of the SHA-1 of `input`.
fn hash_tail(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[hex.len() - ID_LEN..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_strips_separators() {
        assert_eq!(parse_mac("02:42:ac:11:00:02"), Some(0x0242ac110002));
        assert_eq!(parse_mac("02-42-ac-11-00-02"), Some(0x0242ac110002));
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert_eq!(parse_mac(""), None);
        assert_eq!(parse_mac("zz:zz"), None);
    }

    #[test]
    fn test_hash_tail_shape() {
        let id = hash_tail("2472832313346");
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn test_hash_tail_is_deterministic() {
        assert_eq!(hash_tail("input"), hash_tail("input"));
        assert_ne!(hash_tail("input"), hash_tail("other"));
    }

    #[test]
    fn test_unique_id_is_deterministic() {
        let a = unique_id();
        let b = unique_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
