use crate::backend::Backend;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// zstd-compresses content on the way in; names pass through.
pub struct Compress {
    inner: Box<dyn Backend>,
    level: i32,
}

impl Compress {
    pub fn new(inner: Box<dyn Backend>, level: i32) -> Self {
        Self { inner, level }
    }
}

#[async_trait]
impl Backend for Compress {
    fn describe(&self) -> String {
        format!("zstd-{}({})", self.level, self.inner.describe())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let compressed = zstd::encode_all(data.as_ref(), self.level)
            .map_err(|e| EngineError::Compression(format!("{name}: {e}")))?;
        self.inner.put(name, Bytes::from(compressed)).await
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let compressed = self.inner.get(name).await?;
        let data = zstd::decode_all(compressed.as_ref())
            .map_err(|e| EngineError::Compression(format!("{name}: {e}")))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }
}
