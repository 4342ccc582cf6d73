//! PKCE challenge and anti-forgery state generation (RFC 7636, S256)

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// PKCE verifier/challenge pair for one authorization attempt
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair: 32 random bytes, base64url without padding,
    /// challenge = base64url(SHA-256(verifier))
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);

        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(digest);

        Self {
            verifier,
            challenge,
        }
    }
}

/// Single-use random anti-forgery token for the authorization state
/// parameter
pub fn state_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_is_s256_of_verifier() {
        let pair = PkcePair::generate();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pair.verifier.as_bytes()));
        assert_eq!(pair.challenge, expected);
    }

    #[test]
    fn test_verifier_is_base64url_no_padding() {
        let pair = PkcePair::generate();
        assert!(!pair.verifier.contains('='));
        assert!(!pair.verifier.contains('+'));
        assert!(!pair.verifier.contains('/'));
        // 32 bytes encode to 43 characters unpadded
        assert_eq!(pair.verifier.len(), 43);
    }

    #[test]
    fn test_pairs_are_unique() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn test_state_tokens_are_unique() {
        assert_ne!(state_token(), state_token());
        assert!(!state_token().is_empty());
    }
}
