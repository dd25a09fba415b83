use crate::backend::Backend;
use crate::utils::errors::{EngineError, Result};
use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha512};

const BLOCK_LEN: usize = 16;
const LEN_PREFIX: usize = 4;
const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

/// Deterministically encrypts object names; content passes through.
///
/// `name' = hex(aes128_cbc(sha512(secret)[..16], be_i32(len) ++ name ++ spaces))`
///
/// The IV is fixed so the same name always maps to the same ciphertext,
/// which is what lets `get` find an object written by an earlier run.
pub struct NameCrypto {
    inner: Box<dyn Backend>,
    key: [u8; BLOCK_LEN],
}

impl NameCrypto {
    pub fn new(inner: Box<dyn Backend>, secret: &str) -> Self {
        let digest = Sha512::digest(secret.as_bytes());
        let mut key = [0u8; BLOCK_LEN];
        key.copy_from_slice(&digest[..BLOCK_LEN]);
        Self { inner, key }
    }

    fn encrypt_name(&self, name: &str) -> Result<String> {
        let len = i32::try_from(name.len()).map_err(|_| {
            EngineError::InvalidName(format!("name too long ({} bytes)", name.len()))
        })?;

        let mut plain = Vec::with_capacity(LEN_PREFIX + name.len() + BLOCK_LEN);
        plain.extend_from_slice(&len.to_be_bytes());
        plain.extend_from_slice(name.as_bytes());
        if plain.len() % BLOCK_LEN != 0 {
            let pad = BLOCK_LEN - plain.len() % BLOCK_LEN;
            plain.resize(plain.len() + pad, b' ');
        }

        let cipher = cbc::Encryptor::<Aes128>::new_from_slices(&self.key, &ZERO_IV)
            .map_err(|e| EngineError::Config(format!("name cipher: {e}")))?;
        let sealed = cipher.encrypt_padded_vec_mut::<NoPadding>(&plain);
        Ok(hex::encode(sealed))
    }

    fn decrypt_name(&self, encoded: &str) -> Result<String> {
        let invalid = |reason: &str| {
            EngineError::CryptoIntegrity(format!("undecodable name {encoded}: {reason}"))
        };

        let sealed = hex::decode(encoded).map_err(|_| invalid("not hex"))?;
        if sealed.is_empty() || sealed.len() % BLOCK_LEN != 0 {
            return Err(invalid("not a whole number of cipher blocks"));
        }

        let cipher = cbc::Decryptor::<Aes128>::new_from_slices(&self.key, &ZERO_IV)
            .map_err(|e| EngineError::Config(format!("name cipher: {e}")))?;
        let plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&sealed)
            .map_err(|_| invalid("bad padding"))?;

        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&plain[..LEN_PREFIX]);
        let len = i32::from_be_bytes(prefix);
        if len < 0 || LEN_PREFIX + len as usize > plain.len() {
            return Err(invalid("length prefix out of range (wrong key?)"));
        }

        let end = LEN_PREFIX + len as usize;
        let padded_len = end.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if plain.len() != padded_len || plain[end..].iter().any(|&b| b != b' ') {
            return Err(invalid("bad padding (wrong key?)"));
        }

        String::from_utf8(plain[LEN_PREFIX..end].to_vec()).map_err(|_| invalid("not UTF-8"))
    }
}

#[async_trait]
impl Backend for NameCrypto {
    fn describe(&self) -> String {
        format!("name-crypto({})", self.inner.describe())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let sealed = self.encrypt_name(name)?;
        self.inner.put(&sealed, data).await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let sealed = self.encrypt_name(name)?;
        self.inner.get(&sealed).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::NotFound(name.to_string()),
            other => other,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner
            .list()
            .await?
            .iter()
            .map(|sealed| self.decrypt_name(sealed))
            .collect()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let sealed = self.encrypt_name(name)?;
        self.inner.delete(&sealed).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::NotFound(name.to_string()),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;

    fn wrapped(secret: &str) -> (Arc<MemoryBackend>, NameCrypto) {
        let raw = Arc::new(MemoryBackend::new());
        let crypto = NameCrypto::new(Box::new(raw.clone()), secret);
        (raw, crypto)
    }

    #[test]
    fn test_name_round_trip_across_block_boundaries() {
        let (_raw, crypto) = wrapped("secret");
        for len in [0, 1, 11, 12, 13, 16, 28, 100, 300] {
            let name = "n".repeat(len);
            let sealed = crypto.encrypt_name(&name).unwrap();
            assert_eq!(sealed.len() % (BLOCK_LEN * 2), 0);
            assert!(sealed.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
            assert_eq!(crypto.decrypt_name(&sealed).unwrap(), name);
        }
    }

    #[test]
    fn test_encryption_is_deterministic() {
        let (_raw, a) = wrapped("secret");
        let (_raw, b) = wrapped("secret");
        assert_eq!(a.encrypt_name("block").unwrap(), b.encrypt_name("block").unwrap());
        assert_ne!(a.encrypt_name("block").unwrap(), a.encrypt_name("block2").unwrap());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let (_raw, right) = wrapped("right");
        let (_raw, wrong) = wrapped("wrong");
        let digest = "a".repeat(128);
        let sealed = right.encrypt_name(&digest).unwrap();
        assert!(matches!(
            wrong.decrypt_name(&sealed),
            Err(EngineError::CryptoIntegrity(_))
        ));
    }

    #[test]
    fn test_corrupted_names_are_rejected() {
        let (_raw, crypto) = wrapped("secret");
        let sealed = crypto.encrypt_name("some-name").unwrap();

        for bad in [
            String::new(),
            "xyz".to_string(),
            sealed[..sealed.len() - 2].to_string(),
            format!("{sealed}00"),
        ] {
            assert!(matches!(
                crypto.decrypt_name(&bad),
                Err(EngineError::CryptoIntegrity(_))
            ));
        }

        let mut flipped = hex::decode(&sealed).unwrap();
        flipped[0] ^= 0x01;
        assert!(crypto.decrypt_name(&hex::encode(flipped)).is_err());
    }

    #[tokio::test]
    async fn test_backend_sees_only_encrypted_names() -> Result<()> {
        let (raw, crypto) = wrapped("secret");
        crypto.put("alpha", Bytes::from_static(b"1")).await?;
        crypto.put("beta", Bytes::from_static(b"2")).await?;

        let raw_names = raw.list().await?;
        assert!(!raw_names.iter().any(|n| n == "alpha" || n == "beta"));

        let mut names = crypto.list().await?;
        names.sort();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(crypto.get("beta").await?, Bytes::from_static(b"2"));

        crypto.delete("alpha").await?;
        assert_eq!(crypto.list().await?, vec!["beta".to_string()]);
        let err = crypto.get("alpha").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(ref n) if n == "alpha"));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_fails_loudly_on_foreign_names() -> Result<()> {
        let (raw, crypto) = wrapped("secret");
        raw.put("plaintext-name", Bytes::new()).await?;
        assert!(matches!(
            crypto.list().await,
            Err(EngineError::CryptoIntegrity(_))
        ));
        Ok(())
    }
}
