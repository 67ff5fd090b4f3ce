//! Ephemeral blob storage for conversion results.
//!
//! The orchestrator writes each successful result under a fresh key; the
//! archive builder reads them back when the batch completes. Keys are
//! unique per task so no two writers ever contend for the same key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

/// Key/value byte store for converted outputs.
///
/// No partial-write semantics are assumed: a `put` either fully succeeds
/// or the key is treated as absent.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;
    async fn clear(&self) -> anyhow::Result<()>;
}

/// In-memory store, cleared at the start of every batch run.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes) -> anyhow::Result<()> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.blobs.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_clear() {
        let store = MemoryBlobStore::new();
        assert!(store.is_empty().await);

        store.put("a", Bytes::from_static(b"alpha")).await.unwrap();
        store.put("b", Bytes::from_static(b"beta")).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(
            store.get("a").await.unwrap(),
            Some(Bytes::from_static(b"alpha"))
        );
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryBlobStore::new();
        store.put("k", Bytes::from_static(b"v1")).await.unwrap();
        store.put("k", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v2")));
        assert_eq!(store.len().await, 1);
    }
}
