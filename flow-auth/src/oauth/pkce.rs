//! PKCE (Proof Key for Code Exchange) support for OAuth 2.0.
//!
//! Implements RFC 7636 for binding authorization codes to the attempt that requested them.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{config_error, ConfigErrorKind, CryptoErrorKind, Error, ErrorKind};

/// Unreserved URL-safe characters allowed in a code verifier (RFC 7636 §4.1).
pub const VERIFIER_ALPHABET: &[u8; 66] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length bounds from RFC 7636.
pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;

// Largest multiple of the alphabet size that fits in a byte; bytes above it are
// rejected so every character is equally likely.
const REJECTION_LIMIT: u8 = (256 / VERIFIER_ALPHABET.len() * VERIFIER_ALPHABET.len()) as u8;

/// Code challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeMethod {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl ChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::S256 => "S256",
            ChallengeMethod::Plain => "plain",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PKCE code verifier (random string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Generate a new random PKCE verifier of maximal length.
    ///
    /// Draws from the operating system CSPRNG; if it is unavailable the attempt
    /// must be aborted, so the failure is returned rather than papered over.
    pub fn generate() -> Result<Self, Error> {
        let mut verifier = String::with_capacity(MAX_VERIFIER_LEN);
        let mut buf = [0u8; MAX_VERIFIER_LEN];

        while verifier.len() < MAX_VERIFIER_LEN {
            OsRng.try_fill_bytes(&mut buf).map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::Crypto(CryptoErrorKind::RandomUnavailable),
            })?;

            for byte in buf.iter().copied().filter(|b| *b < REJECTION_LIMIT) {
                if verifier.len() == MAX_VERIFIER_LEN {
                    break;
                }
                let index = byte as usize % VERIFIER_ALPHABET.len();
                verifier.push(VERIFIER_ALPHABET[index] as char);
            }
        }

        Ok(Self(verifier))
    }

    /// Create a PKCE verifier from an existing string, checking RFC 7636 constraints.
    pub fn parse(verifier: &str) -> Result<Self, Error> {
        if !is_valid_verifier(verifier) {
            return Err(config_error(
                ConfigErrorKind::InvalidValue("code_verifier"),
                "code verifier must be 43-128 unreserved characters",
            ));
        }
        Ok(Self(verifier.to_string()))
    }

    /// Create a PKCE verifier from a previously stored string without validation.
    pub fn from_string(verifier: String) -> Self {
        Self(verifier)
    }

    /// Get the verifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate the corresponding code challenge.
    pub fn challenge(&self, method: ChallengeMethod) -> PkceChallenge {
        PkceChallenge::from_verifier(self, method)
    }
}

/// PKCE code challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    /// Create a code challenge from a verifier.
    ///
    /// S256 uses SHA256 hashing and unpadded base64url encoding as per RFC 7636.
    pub fn from_verifier(verifier: &PkceVerifier, method: ChallengeMethod) -> Self {
        match method {
            ChallengeMethod::S256 => {
                let mut hasher = Sha256::new();
                hasher.update(verifier.as_str().as_bytes());
                let hash = hasher.finalize();
                Self(URL_SAFE_NO_PAD.encode(hash))
            }
            ChallengeMethod::Plain => Self(verifier.as_str().to_string()),
        }
    }

    /// Get the challenge string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Verifier/challenge pair owned by a single authorization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkcePair {
    pub verifier: PkceVerifier,
    pub challenge: PkceChallenge,
    pub method: ChallengeMethod,
}

impl PkcePair {
    /// Generate a fresh S256 pair.
    pub fn generate() -> Result<Self, Error> {
        Self::generate_with(ChallengeMethod::S256)
    }

    /// Generate a pair with an explicit challenge method.
    ///
    /// `Plain` offers no protection against an intercepted authorization request and
    /// is only used when the server cannot do S256; choosing it is always logged.
    pub fn generate_with(method: ChallengeMethod) -> Result<Self, Error> {
        if method == ChallengeMethod::Plain {
            warn!("PKCE downgraded to the plain challenge method; security is degraded");
        }
        let verifier = PkceVerifier::generate()?;
        let challenge = verifier.challenge(method);
        Ok(Self {
            verifier,
            challenge,
            method,
        })
    }

    /// Recompute the challenge from `verifier` and compare.
    pub fn verify(verifier: &str, challenge: &str, method: ChallengeMethod) -> bool {
        let verifier = PkceVerifier::from_string(verifier.to_string());
        verifier.challenge(method).as_str() == challenge
    }
}

/// True when `verifier` has an allowed length and only unreserved characters.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier.bytes().all(|b| VERIFIER_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_verifier_generation() {
        let verifier = PkceVerifier::generate().unwrap();
        assert_eq!(verifier.as_str().len(), MAX_VERIFIER_LEN);
        assert!(is_valid_verifier(verifier.as_str()));
    }

    #[test]
    fn test_pkce_verifiers_are_unique() {
        let a = PkceVerifier::generate().unwrap();
        let b = PkceVerifier::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pkce_challenge_rfc7636_vector() {
        // Appendix B of RFC 7636
        let verifier =
            PkceVerifier::from_string("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string());
        let challenge = verifier.challenge(ChallengeMethod::S256);
        assert_eq!(
            challenge.as_str(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_pkce_pair_round_trip() {
        for _ in 0..32 {
            let pair = PkcePair::generate().unwrap();
            assert!(is_valid_verifier(pair.verifier.as_str()));
            assert!(PkcePair::verify(
                pair.verifier.as_str(),
                pair.challenge.as_str(),
                pair.method
            ));
            assert!(!pair.challenge.as_str().contains('='));
        }
    }

    #[test]
    fn test_plain_pair_challenge_equals_verifier() {
        let pair = PkcePair::generate_with(ChallengeMethod::Plain).unwrap();
        assert_eq!(pair.verifier.as_str(), pair.challenge.as_str());
        assert!(PkcePair::verify(
            pair.verifier.as_str(),
            pair.challenge.as_str(),
            ChallengeMethod::Plain
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_verifier() {
        let pair = PkcePair::generate().unwrap();
        let other = PkceVerifier::generate().unwrap();
        assert!(!PkcePair::verify(
            other.as_str(),
            pair.challenge.as_str(),
            ChallengeMethod::S256
        ));
    }

    #[test]
    fn test_parse_rejects_short_and_reserved() {
        assert!(PkceVerifier::parse("short").is_err());
        let reserved = "a".repeat(42) + "/";
        assert!(PkceVerifier::parse(&reserved).is_err());
        assert!(PkceVerifier::parse(&"a".repeat(43)).is_ok());
    }
}
