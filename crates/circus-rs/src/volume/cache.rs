//! Optional local cache for metadata and finished volumes.
//!
//! Caches are best-effort: a miss and a failure look the same to the loader.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::bytes::Bytes;

use super::metadata::VolumeMetadata;
use crate::transfer::protocol::VolumeSpecifier;

/// Cache key: the volume's identity, partial range included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(volume: &VolumeSpecifier) -> Self {
        Self(volume.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait VolumeCache: Send + Sync + 'static {
    async fn get_metadata(&self, key: &CacheKey) -> Option<VolumeMetadata>;
    async fn put_metadata(&self, key: &CacheKey, metadata: &VolumeMetadata);
    async fn get_volume(&self, key: &CacheKey) -> Option<Bytes>;
    async fn put_volume(&self, key: &CacheKey, data: Bytes);
}

/// Never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl VolumeCache for NullCache {
    async fn get_metadata(&self, _key: &CacheKey) -> Option<VolumeMetadata> {
        None
    }

    async fn put_metadata(&self, _key: &CacheKey, _metadata: &VolumeMetadata) {}

    async fn get_volume(&self, _key: &CacheKey) -> Option<Bytes> {
        None
    }

    async fn put_volume(&self, _key: &CacheKey, _data: Bytes) {}
}

/// In-process cache, shared by every loader holding it.
#[derive(Debug, Default)]
pub struct MemoryCache {
    metadata: DashMap<CacheKey, VolumeMetadata>,
    volumes: DashMap<CacheKey, Bytes>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_volume(&self, key: &CacheKey) -> bool {
        self.volumes.contains_key(key)
    }
}

#[async_trait]
impl VolumeCache for MemoryCache {
    async fn get_metadata(&self, key: &CacheKey) -> Option<VolumeMetadata> {
        self.metadata.get(key).map(|m| m.value().clone())
    }

    async fn put_metadata(&self, key: &CacheKey, metadata: &VolumeMetadata) {
        self.metadata.insert(key.clone(), metadata.clone());
    }

    async fn get_volume(&self, key: &CacheKey) -> Option<Bytes> {
        self.volumes.get(key).map(|v| v.value().clone())
    }

    async fn put_volume(&self, key: &CacheKey, data: Bytes) {
        tracing::debug!(key = %key, bytes = data.len(), "Caching volume");
        self.volumes.insert(key.clone(), data);
    }
}
