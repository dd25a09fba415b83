use crate::backend::Backend;
use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

/// Fixed application salt. The key must be reproducible from the shared
/// secret alone, since nothing is stored next to the data.
const KEY_SALT: &[u8] = b"backup-engine/data-crypto/v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// Argon2id cost: 19 MiB, 2 passes, 1 lane.
const ARGON2_MEMORY_KIB: u32 = 19 * 1024;
const ARGON2_TIME_COST: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

/// Encrypts content with AES-256-GCM; names pass through unchanged.
///
/// Wire format: `[12-byte random nonce][ciphertext + 16-byte tag]`. The
/// object name is bound as associated data, so a payload moved to another
/// name fails authentication just like a corrupted one.
pub struct DataCrypto {
    inner: Box<dyn Backend>,
    cipher: Aes256Gcm,
}

impl DataCrypto {
    pub fn new(inner: Box<dyn Backend>, secret: &str) -> Result<Self> {
        let key = derive_key(secret.as_bytes())?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EngineError::Config(format!("AES-GCM key: {e}")))?;
        Ok(Self { inner, cipher })
    }

    fn encrypt(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|e| EngineError::CryptoIntegrity(format!("encrypt {name}: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EngineError::CryptoIntegrity(format!(
                "{name}: payload too short ({} bytes)",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| {
                EngineError::CryptoIntegrity(format!("{name}: authentication failed"))
            })
    }
}

fn derive_key(secret: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME_COST, ARGON2_PARALLELISM, Some(32))
        .map_err(|e| EngineError::Config(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret, KEY_SALT, &mut key)
        .map_err(|e| EngineError::Config(format!("key derivation: {e}")))?;
    Ok(key)
}

#[async_trait]
impl Backend for DataCrypto {
    fn describe(&self) -> String {
        format!("data-crypto({})", self.inner.describe())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let sealed = self.encrypt(name, &data)?;
        self.inner.put(name, Bytes::from(sealed)).await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let sealed = self.inner.get(name).await?;
        Ok(Bytes::from(self.decrypt(name, &sealed)?))
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }
}
