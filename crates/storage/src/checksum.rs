use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`. This is the checksum format stored on
/// function rows and verified before execution.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // sha256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_changes_with_content() {
        assert_ne!(sha256_hex(b"print('a')"), sha256_hex(b"print('b')"));
    }
}
