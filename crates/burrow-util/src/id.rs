//! Random identifiers

use rand::RngCore;

/// Random 16-hex-character id, used for server-assigned run ids.
pub fn rand_id() -> String {
    rand_id_with_len(8)
}

/// Random hex id over `len` bytes (twice as many hex characters).
pub fn rand_id_with_len(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rand_id_length_and_charset() {
        let id = rand_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_rand_id_with_len() {
        assert_eq!(rand_id_with_len(4).len(), 8);
        assert_eq!(rand_id_with_len(20).len(), 40);
    }

    #[test]
    fn test_rand_ids_differ() {
        assert_ne!(rand_id(), rand_id());
    }
}
