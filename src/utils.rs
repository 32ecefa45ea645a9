// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for tapedeck.

use sha2::{Digest, Sha256};

/// Mask a sensitive string (like bearer tokens) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use tapedeck::utils::mask_sensitive;
///
/// let token = "td_live_abcdefghijklmnopqrstuvwxyz";
/// assert_eq!(mask_sensitive(token, 8), "td_live_...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        // Short secrets are fully masked; the prefix would be the whole secret.
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Stable, filesystem-safe directory name for an opaque identifier.
pub fn path_safe_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("td_live_secret123", 8), "td_live_...");
        assert_eq!(mask_sensitive("short", 8), "...");
        assert_eq!(mask_sensitive("", 8), "...");
    }

    #[test]
    fn test_path_safe_digest() {
        let a = path_safe_digest("42");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, path_safe_digest("42"));
        assert_ne!(a, path_safe_digest("43"));
    }
}
