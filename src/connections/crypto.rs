//! Secret encryption for stored connection credentials.
//!
//! AES-256-GCM with a 12-byte random IV per secret. The 32-byte key is the
//! SHA-256 digest of the configured master passphrase, so records written by
//! earlier deployments with the same passphrase still decrypt.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::errors::ConnectionError;

/// IV length required by AES-GCM.
pub const IV_LEN: usize = 12;

/// An encrypted secret as stored in the connection record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("iv_len", &self.iv.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Encrypts and decrypts connection secrets with the process master key.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher { .. }")
    }
}

impl SecretCipher {
    /// Derive the cipher from the master passphrase.
    pub fn from_master_key(master_key: &str) -> Result<Self, ConnectionError> {
        if master_key.is_empty() {
            return Err(ConnectionError::DecryptionFailed {
                reason: "master key is not configured".into(),
            });
        }
        let key: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(master_key.as_bytes()).into());
        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|e| ConnectionError::DecryptionFailed {
                reason: format!("invalid key length: {e}"),
            })?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext secret under a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, ConnectionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| ConnectionError::DecryptionFailed {
                reason: "encryption failed".into(),
            })?;
        Ok(EncryptedSecret {
            iv: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a stored secret.
    ///
    /// Fails with `DecryptionFailed` when the key is wrong or the IV or
    /// ciphertext was altered. The plaintext is wiped when dropped.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<String>, ConnectionError> {
        if secret.iv.len() != IV_LEN {
            return Err(ConnectionError::DecryptionFailed {
                reason: format!("expected a {IV_LEN}-byte IV, found {} bytes", secret.iv.len()),
            });
        }
        let nonce = Nonce::from_slice(&secret.iv);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(nonce, secret.ciphertext.as_slice())
                .map_err(|_| ConnectionError::DecryptionFailed {
                    reason: "authentication tag mismatch".into(),
                })?,
        );
        let text = std::str::from_utf8(&plaintext).map_err(|_| ConnectionError::DecryptionFailed {
            reason: "secret is not valid UTF-8".into(),
        })?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = SecretCipher::from_master_key("correct horse").unwrap();
        let secret = cipher.encrypt("s3cr3t-p@ss").unwrap();
        assert_eq!(secret.iv.len(), IV_LEN);
        assert_ne!(secret.ciphertext, b"s3cr3t-p@ss".to_vec());
        assert_eq!(cipher.decrypt(&secret).unwrap().as_str(), "s3cr3t-p@ss");
    }

    #[test]
    fn test_each_encryption_uses_fresh_iv() {
        let cipher = SecretCipher::from_master_key("k").unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let secret = SecretCipher::from_master_key("key-a").unwrap().encrypt("pw").unwrap();
        let err = SecretCipher::from_master_key("key-b")
            .unwrap()
            .decrypt(&secret)
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DecryptionFailed { .. }));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = SecretCipher::from_master_key("k").unwrap();
        let mut secret = cipher.encrypt("pw").unwrap();
        secret.ciphertext[0] ^= 0x01;
        assert!(cipher.decrypt(&secret).is_err());
    }

    #[test]
    fn test_tampered_iv_fails() {
        let cipher = SecretCipher::from_master_key("k").unwrap();
        let mut secret = cipher.encrypt("pw").unwrap();
        secret.iv[11] ^= 0x80;
        assert!(cipher.decrypt(&secret).is_err());
        secret.iv.truncate(8);
        assert!(cipher.decrypt(&secret).is_err());
    }

    #[test]
    fn test_empty_master_key_rejected() {
        assert!(SecretCipher::from_master_key("").is_err());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let cipher = SecretCipher::from_master_key("very-secret-master").unwrap();
        let secret = cipher.encrypt("hunter2").unwrap();
        let rendered = format!("{cipher:?} {secret:?}");
        assert!(!rendered.contains("very-secret-master"));
        assert!(rendered.contains("ciphertext_len"));
    }
}
