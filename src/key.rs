//! Cache key generation.
//!
//! A key is the radix-36 rendering of the first 128 bits of a SHA-256 digest
//! of the locator. Same locator, same key, across process runs. Collisions are
//! an accepted risk of the digest and are not actively resolved.

use sha2::{Digest, Sha256};

/// Filesystem-safe key naming a disk store entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a locator.
    ///
    /// The key is locator-only by design: the disk cache stores one canonical
    /// copy per locator, not one per requested size.
    #[must_use]
    pub fn from_locator(locator: &str) -> Self {
        let digest = Sha256::digest(locator.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(to_radix36(u128::from_be_bytes(bytes)))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_radix36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(25);
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize] as char);
        value /= 36;
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_locator_same_key() {
        let a = CacheKey::from_locator("http://example.com/image.png");
        let b = CacheKey::from_locator("http://example.com/image.png");
        assert_eq!(a, b);
    }

    #[test]
    fn different_locators_differ() {
        let a = CacheKey::from_locator("http://example.com/a.png");
        let b = CacheKey::from_locator("http://example.com/b.png");
        assert_ne!(a, b);
    }

    #[test]
    fn key_is_lowercase_alphanumeric() {
        let key = CacheKey::from_locator("file:///tmp/photo.jpg");
        assert!(!key.as_str().is_empty());
        assert!(
            key.as_str()
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn radix36_known_values() {
        assert_eq!(to_radix36(0), "0");
        assert_eq!(to_radix36(35), "z");
        assert_eq!(to_radix36(36), "10");
        assert_eq!(to_radix36(36 * 36 + 1), "101");
    }
}
