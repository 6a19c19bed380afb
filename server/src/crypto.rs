use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};

use crate::error::CryptoError;

/// Cipher for secret columns (printer credentials, webhook URLs, SMTP
/// password). Key is loaded once at startup; ciphertext layout is
/// base64(nonce || aes-256-gcm ciphertext).
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CryptoError> {
        let key_bytes = B64
            .decode(key_b64.trim())
            .map_err(|_| CryptoError::BadKeyEncoding)?;
        if key_bytes.len() != 32 {
            return Err(CryptoError::BadKeyLength(key_bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        // Encryption with a fresh nonce cannot fail for well-formed keys.
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .unwrap_or_default();
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        B64.encode(combined)
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let combined = B64.decode(stored.trim()).map_err(|_| CryptoError::Decrypt)?;
        if combined.len() < 12 {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        SecretCipher::from_base64_key(&B64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn round_trips_credentials() {
        let cipher = test_cipher();
        let stored = cipher.encrypt("01S00C123456789|12345678");
        assert_ne!(stored, "01S00C123456789|12345678");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "01S00C123456789|12345678");
    }

    #[test]
    fn fresh_nonce_per_encrypt() {
        let cipher = test_cipher();
        assert_ne!(cipher.encrypt("secret"), cipher.encrypt("secret"));
    }

    #[test]
    fn rejects_wrong_key() {
        let stored = test_cipher().encrypt("secret");
        let other = SecretCipher::from_base64_key(&B64.encode([8u8; 32])).unwrap();
        assert!(matches!(other.decrypt(&stored), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            SecretCipher::from_base64_key(&B64.encode([1u8; 16])),
            Err(CryptoError::BadKeyLength(16))
        ));
    }
}
