//! AES-256-GCM encryption for values written to disk.
//!
//! Ciphertext layout: base64(nonce || ciphertext || tag) with a fresh 12-byte
//! nonce per value. Keys are 32 bytes, supplied as 64 hex characters.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{config_error, storage_error, ConfigErrorKind, Error, ErrorKind, StorageErrorKind};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// A parsed store encryption key.
#[derive(Clone)]
pub struct ValueCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueCipher([REDACTED])")
    }
}

impl ValueCipher {
    /// Parse a hex-encoded 32-byte key.
    pub fn from_hex(key_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(key_hex.trim()).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Configuration(ConfigErrorKind::InvalidValue("store_encryption_key")),
        })?;
        if bytes.len() != KEY_SIZE {
            return Err(config_error(
                ConfigErrorKind::InvalidValue("store_encryption_key"),
                "store encryption key must be 32 bytes (64 hex characters)",
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| {
            storage_error(StorageErrorKind::EncryptionFailed, "could not initialise cipher")
        })?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, Error> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::EncryptionFailed),
        })?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| storage_error(StorageErrorKind::EncryptionFailed, "encryption failed"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, Error> {
        let combined = BASE64.decode(encoded).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::DecryptionFailed),
        })?;
        if combined.len() < NONCE_SIZE {
            return Err(storage_error(
                StorageErrorKind::DecryptionFailed,
                "ciphertext shorter than its nonce",
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                storage_error(
                    StorageErrorKind::DecryptionFailed,
                    "wrong key or tampered ciphertext",
                )
            })?;

        String::from_utf8(plaintext).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::DecryptionFailed),
        })
    }
}

/// Encrypt `plaintext` with a hex key.
pub fn encrypt(plaintext: &str, key_hex: &str) -> Result<String, Error> {
    ValueCipher::from_hex(key_hex)?.encrypt(plaintext)
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(encoded: &str, key_hex: &str) -> Result<String, Error> {
    ValueCipher::from_hex(key_hex)?.decrypt(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encrypt_decrypt() {
        let encrypted = encrypt(r#"{"access_token":"at"}"#, TEST_KEY).unwrap();
        assert!(!encrypted.contains("access_token"));
        assert_eq!(decrypt(&encrypted, TEST_KEY).unwrap(), r#"{"access_token":"at"}"#);
    }

    #[test]
    fn test_nonce_is_fresh_per_value() {
        let cipher = ValueCipher::from_hex(TEST_KEY).unwrap();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_bad_key_is_configuration_error() {
        let err = ValueCipher::from_hex("abcd").unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigErrorKind::InvalidValue("store_encryption_key"))
        );
        assert!(ValueCipher::from_hex("not-hex!").is_err());
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let encrypted = encrypt("secret", TEST_KEY).unwrap();
        let wrong_key = "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
        let err = decrypt(&encrypted, wrong_key).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Storage(StorageErrorKind::DecryptionFailed)
        );
    }

    #[test]
    fn test_truncated_ciphertext() {
        // "abc" in base64
        let err = decrypt("YWJj", TEST_KEY).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Storage(StorageErrorKind::DecryptionFailed)
        );
    }
}
