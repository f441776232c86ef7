// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// Entropy for generated API keys and database passwords.
pub const SECRET_BYTES: usize = 24;
/// Entropy for the generated dashboard password.
pub const DASHBOARD_PASSWORD_BYTES: usize = 16;

const BASIC_AUTH_COST: u32 = 10;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate `bytes` random bytes and return them base64-encoded (STANDARD alphabet).
pub fn generate_secret(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| anyhow::anyhow!("Failed to gather random bytes for secret"))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

/// Build an htpasswd-style basic-auth entry (`user:$2y$...`) for the edge proxy.
///
/// Every `$` is doubled: compose interpolates `$name` in values, and `$$` is its
/// literal-dollar escape.
pub fn basic_auth_entry(user: &str, password: &str) -> Result<String> {
    let hash = bcrypt::hash_with_result(password, BASIC_AUTH_COST)
        .map_err(|e| anyhow::anyhow!("Failed to hash basic-auth password: {}", e))?
        .format_for_version(bcrypt::Version::TwoY);
    Ok(escape_compose_dollars(&format!("{}:{}", user, hash)))
}

/// Double every `$` so compose's variable substitution leaves the value untouched.
pub fn escape_compose_dollars(value: &str) -> String {
    value.replace('$', "$$")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_decodes_to_requested_length() {
        for bytes in [16, 24] {
            let secret = generate_secret(bytes).unwrap();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&secret)
                .expect("valid base64");
            assert_eq!(decoded.len(), bytes);
        }
    }

    #[test]
    fn generated_secrets_differ() {
        let a = generate_secret(SECRET_BYTES).unwrap();
        let b = generate_secret(SECRET_BYTES).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn escape_compose_dollars_doubles_each_dollar() {
        assert_eq!(escape_compose_dollars("$2y$10$abc"), "$$2y$$10$$abc");
        assert_eq!(escape_compose_dollars("plain"), "plain");
    }

    #[test]
    fn basic_auth_entry_is_escaped_and_verifiable() {
        let entry = basic_auth_entry("admin", "hunter2-but-longer").unwrap();
        assert!(entry.starts_with("admin:$$2y$$10$$"), "{}", entry);

        let hash = entry
            .strip_prefix("admin:")
            .unwrap()
            .replace("$$", "$");
        assert!(bcrypt::verify("hunter2-but-longer", &hash).unwrap());
        assert!(!bcrypt::verify("wrong", &hash).unwrap());
    }
}
