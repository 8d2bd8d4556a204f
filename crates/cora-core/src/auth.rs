//! Challenge/response logon digests.
//!
//! The server answers a challenge request with a server token and a digest
//! seed. The client derives its own token from the seed and a random nonce,
//! then proves knowledge of the password with
//! `SHA-256(client_token || server_token || UTF-16LE(password))`.

use aws_lc_rs::digest::{Context, SHA256};
use rand::RngCore;

use crate::constants::CLIENT_TOKEN_NONCE_LEN;

/// Generate the random part of a client token.
pub fn generate_nonce() -> [u8; CLIENT_TOKEN_NONCE_LEN] {
    let mut nonce = [0u8; CLIENT_TOKEN_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Derive the client token: `SHA-256(seed (big-endian) || nonce)`.
pub fn client_token(seed: u32, nonce: &[u8]) -> Vec<u8> {
    let mut ctx = Context::new(&SHA256);
    ctx.update(&seed.to_be_bytes());
    ctx.update(nonce);
    ctx.finish().as_ref().to_vec()
}

/// Password as little-endian UTF-16 code units.
pub fn password_utf16le(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Compute the challenge response digest.
pub fn response_digest(client_token: &[u8], server_token: &[u8], password: &str) -> Vec<u8> {
    let mut ctx = Context::new(&SHA256);
    ctx.update(client_token);
    ctx.update(server_token);
    ctx.update(&password_utf16le(password));
    ctx.finish().as_ref().to_vec()
}

/// Check a response digest in constant time.
pub fn verify_response(
    client_token: &[u8],
    server_token: &[u8],
    password: &str,
    digest: &[u8],
) -> bool {
    let expected = response_digest(client_token, server_token, password);
    expected.len() == digest.len()
        && expected
            .iter()
            .zip(digest)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_encoding_is_little_endian() {
        assert_eq!(password_utf16le("Ab"), [0x41, 0x00, 0x62, 0x00]);
        assert_eq!(password_utf16le("\u{20ac}"), [0xac, 0x20]);
        assert!(password_utf16le("").is_empty());
    }

    #[test]
    fn client_token_depends_on_seed_and_nonce() {
        let nonce = [7u8; CLIENT_TOKEN_NONCE_LEN];
        let a = client_token(1, &nonce);
        assert_eq!(a.len(), 32);
        assert_eq!(a, client_token(1, &nonce));
        assert_ne!(a, client_token(2, &nonce));
        assert_ne!(a, client_token(1, &[8u8; CLIENT_TOKEN_NONCE_LEN]));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn digest_verifies_only_with_right_password() {
        let client = client_token(99, &generate_nonce());
        let server = b"server-token".to_vec();
        let digest = response_digest(&client, &server, "pw");
        assert!(verify_response(&client, &server, "pw", &digest));
        assert!(!verify_response(&client, &server, "PW", &digest));
        assert!(!verify_response(&client, &server, "pw", &digest[..10]));
    }

    #[test]
    fn digest_of_known_input() {
        // SHA-256 of the empty string.
        let digest = response_digest(&[], &[], "");
        assert_eq!(
            digest[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
        );
    }
}
