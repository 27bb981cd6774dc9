//! AES-256-GCM encryption for credentials at rest.
//!
//! Ciphertexts are laid out as `nonce || ciphertext` and stored base64
//! encoded. The key is always supplied by the caller.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::VaultError;

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Key as written in config files: standard base64 of 32 raw bytes.
    pub fn from_base64_key(encoded: &str) -> Result<Self, VaultError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(VaultError::MissingKey);
        }
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::InvalidKey(format!("not base64: {e}")))?;
        Self::new(&raw)
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        BASE64.encode(key.as_slice())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    pub fn decrypt(&self, combined: &[u8]) -> Result<Vec<u8>, VaultError> {
        if combined.len() < NONCE_SIZE {
            return Err(VaultError::InvalidFormat(format!(
                "encrypted data too short: {} bytes",
                combined.len()
            )));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decryption)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        Ok(BASE64.encode(self.encrypt(plaintext.as_bytes())?))
    }

    pub fn decrypt_str(&self, encoded: &str) -> Result<String, VaultError> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::InvalidFormat(format!("invalid base64 encoding: {e}")))?;
        let plain = self.decrypt(&combined)?;
        String::from_utf8(plain).map_err(|_| VaultError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt() {
        let c = cipher();
        let sealed = c.encrypt_str("ya29.secret-token").unwrap();
        assert!(!sealed.contains("ya29"));
        assert_eq!(c.decrypt_str(&sealed).unwrap(), "ya29.secret-token");
    }

    #[test]
    fn same_plaintext_gets_fresh_nonce() {
        let c = cipher();
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = cipher().encrypt(b"token").unwrap();
        let other = TokenCipher::new(&[8u8; 32]).unwrap();
        assert_eq!(other.decrypt(&sealed), Err(VaultError::Decryption));
    }

    #[test]
    fn truncated_data_is_invalid_format() {
        assert!(matches!(
            cipher().decrypt(&[1, 2, 3]),
            Err(VaultError::InvalidFormat(_))
        ));
        assert!(cipher().decrypt_str("not base64!!").is_err());
    }

    #[test]
    fn key_must_be_present_and_sized() {
        assert_eq!(
            TokenCipher::from_base64_key("  ").err(),
            Some(VaultError::MissingKey)
        );
        assert!(matches!(
            TokenCipher::from_base64_key(&BASE64.encode([0u8; 16])),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(TokenCipher::from_base64_key(&TokenCipher::generate_key()).is_ok());
    }
}
