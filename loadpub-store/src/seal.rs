//! Sealing of confidential configuration values (connection strings).
//!
//! Values are encrypted with AES-256-GCM under a key derived by HKDF-SHA256
//! from a shared passphrase and salt, so any reader holding the same pair can
//! open them. Output is lowercase hex of `nonce || ciphertext`.

use crate::gateway::StoreError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"loadpub connection string";

/// Passphrase shared with the readers of stored result sets.
pub const DEFAULT_PASSPHRASE: &str = "{51E6A7AC-06C2-466F-B7E8-4B0A00F6A21F}";

/// Salt shared with the readers of stored result sets.
pub const DEFAULT_SALT: [u8; 13] = [
    0x49, 0x16, 0x49, 0x2e, 0x11, 0x1e, 0x45, 0x24, 0x86, 0x05, 0x01, 0x03, 0x62,
];

#[derive(Clone)]
pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSealer").finish_non_exhaustive()
    }
}

impl SecretSealer {
    pub fn new(passphrase: &str, salt: &[u8]) -> Result<Self, StoreError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| StoreError::Seal(e.to_string()))?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| StoreError::Seal(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Sealer keyed with [`DEFAULT_PASSPHRASE`] and [`DEFAULT_SALT`].
    pub fn shared() -> Result<Self, StoreError> {
        Self::new(DEFAULT_PASSPHRASE, &DEFAULT_SALT)
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<String, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| StoreError::Seal(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, StoreError> {
        let bytes = hex::decode(sealed).map_err(|e| StoreError::Seal(e.to_string()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(StoreError::Seal("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Seal(e.to_string()))?;
        String::from_utf8(plain).map_err(|e| StoreError::Seal(e.to_string()))
    }
}
