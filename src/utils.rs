//! Utility functions for the pairing engine

use uuid::Uuid;

/// Generate a fresh peer identity
pub fn generate_peer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shortened identity for log lines
pub fn short_id(peer_id: &str) -> &str {
    let end = peer_id
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(peer_id.len());
    &peer_id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_ids() {
        let id1 = generate_peer_id();
        let id2 = generate_peer_id();
        assert_ne!(id1, id2);
        assert!(!id1.is_empty());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
    }
}
