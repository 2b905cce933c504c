//! AES-256-GCM sealing of template vectors at rest.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext`, where the plaintext is
//! the vector as little-endian `f32`s.

use crate::error::StoreError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::io::Write;
use std::path::Path;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct TemplateCipher {
    cipher: Aes256Gcm,
}

impl TemplateCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Reads the key file, creating it with a fresh random key (mode 0600)
    /// if it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Crypto(format!(
                    "key file {} must hold exactly {KEY_LEN} bytes, found {}",
                    path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(Self::from_key(&key));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&key)?;
        file.sync_all()?;

        tracing::info!(path = %path.display(), "generated template key");
        Ok(Self::from_key(&key))
    }

    pub fn seal(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| StoreError::Crypto("template encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<f32>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Crypto("sealed template too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto("template authentication failed".into()))?;

        if plaintext.len() % 4 != 0 {
            return Err(StoreError::Crypto("template length not a multiple of 4".into()));
        }
        Ok(plaintext
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
