use sha2::{Digest, Sha256};

/// Compute the content fingerprint of a byte buffer.
///
/// Fingerprints are the unit of change detection for workspace sync: a file
/// is re-transferred only when its fingerprint differs from the last one the
/// cache observed. Lowercase hex Sha256, deterministic across platforms.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"hello"), fingerprint(b"hello"));
        assert_ne!(fingerprint(b"hello"), fingerprint(b"hello "));
    }

    #[test]
    fn fingerprint_of_empty_input() {
        // Sha256 of the empty string, a fixed well-known value.
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_lowercase_hex() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
