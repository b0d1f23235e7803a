use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// AES-256-GCM vault for provider API keys. Keys are ciphertext at
/// rest; decryption happens lazily, per request, and the plaintext is
/// never persisted.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Derive the vault key from the configured master secret.
    pub fn new(master_secret: &str) -> Self {
        let key = Sha256::digest(master_secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("sha256 digest is a valid aes-256 key");
        Self { cipher }
    }

    /// Seal a plaintext API key: `base64(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("credential encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = B64
            .decode(sealed.trim())
            .map_err(|_| anyhow!("credential ciphertext is not valid base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(anyhow!("credential ciphertext too short"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow!("credential decryption failed"))?;
        String::from_utf8(plaintext).map_err(|_| anyhow!("credential plaintext is not UTF-8"))
    }
}
