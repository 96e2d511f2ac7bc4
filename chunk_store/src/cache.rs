//! Read-through caching of chunk bodies.
//!
//! The cache is strictly an accelerator: the planner consults it before the
//! blob store and refills it afterwards, and every cache failure degrades
//! to a miss rather than failing the request.

use async_trait::async_trait;
use bytes::Bytes;
use data_types::Chunk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

/// An error from the cache backend. Callers log these and continue.
#[derive(Debug)]
pub struct CacheError {
    message: String,
}

impl CacheError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk cache error: {}", self.message)
    }
}

impl std::error::Error for CacheError {}

/// The outcome of a cache probe.
#[derive(Debug, Default)]
pub struct CacheFetch {
    /// Chunks whose bodies were cached, bodies attached.
    pub hits: Vec<Chunk>,
    /// Chunks the cache knows nothing about.
    pub misses: Vec<Chunk>,
}

/// An abstract cache of chunk bodies.
#[async_trait]
pub trait ChunkCache: Debug + Send + Sync + 'static {
    /// Partition `chunks` into hits (bodies attached) and misses. Never
    /// fabricates chunks.
    async fn fetch(&self, tenant: &str, chunks: Vec<Chunk>) -> Result<CacheFetch, CacheError>;

    /// Store the bodies of all chunks that carry one. Best effort.
    async fn store(&self, tenant: &str, chunks: &[Chunk]) -> Result<(), CacheError>;

    /// Store a single chunk's body. Best effort.
    async fn store_chunk_data(&self, tenant: &str, chunk: &Chunk) -> Result<(), CacheError>;
}

/// A process-local [`ChunkCache`] over a plain map, keyed like the blob
/// store (`tenant/chunk ID`).
#[derive(Debug, Default)]
pub struct MemoryCache {
    bodies: Mutex<HashMap<String, Bytes>>,
    fail_fetches: AtomicBool,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Default::default()
    }

    /// Make every subsequent fetch fail, for degradation tests.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::Relaxed);
    }

    /// Number of cached bodies.
    pub fn len(&self) -> usize {
        self.bodies.lock().len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(tenant: &str, chunk_id: &str) -> String {
        format!("{}/{}", tenant, chunk_id)
    }
}

#[async_trait]
impl ChunkCache for MemoryCache {
    async fn fetch(&self, tenant: &str, chunks: Vec<Chunk>) -> Result<CacheFetch, CacheError> {
        if self.fail_fetches.load(Ordering::Relaxed) {
            return Err(CacheError::new("injected fetch failure"));
        }

        let bodies = self.bodies.lock();
        let mut fetch = CacheFetch::default();
        for mut chunk in chunks {
            match bodies.get(&Self::key(tenant, &chunk.id)) {
                Some(body) => {
                    chunk.data = Some(body.clone());
                    fetch.hits.push(chunk);
                }
                None => fetch.misses.push(chunk),
            }
        }
        Ok(fetch)
    }

    async fn store(&self, tenant: &str, chunks: &[Chunk]) -> Result<(), CacheError> {
        let mut bodies = self.bodies.lock();
        for chunk in chunks {
            if let Some(data) = &chunk.data {
                bodies.insert(Self::key(tenant, &chunk.id), data.clone());
            }
        }
        Ok(())
    }

    async fn store_chunk_data(&self, tenant: &str, chunk: &Chunk) -> Result<(), CacheError> {
        if let Some(data) = &chunk.data {
            self.bodies
                .lock()
                .insert(Self::key(tenant, &chunk.id), data.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{Labels, Timestamp};

    fn chunk(job: &str) -> Chunk {
        Chunk::new(
            Labels::from([("__name__", "requests"), ("job", job)]),
            Timestamp::from_unix_millis(0),
            Timestamp::from_unix_millis(10),
        )
    }

    #[tokio::test]
    async fn test_fetch_partitions_hits_and_misses() {
        let cache = MemoryCache::new();
        let cached = chunk("api").with_data(&b"api-body"[..]);
        let uncached = chunk("web");

        cache.store("tenant", &[cached.clone()]).await.unwrap();
        assert_eq!(cache.len(), 1);

        let fetch = cache
            .fetch("tenant", vec![chunk("api"), uncached.clone()])
            .await
            .unwrap();
        assert_eq!(fetch.hits.len(), 1);
        assert_eq!(fetch.hits[0].data, Some(Bytes::from(&b"api-body"[..])));
        assert_eq!(fetch.misses, vec![uncached]);
    }

    #[tokio::test]
    async fn test_tenants_do_not_share_bodies() {
        let cache = MemoryCache::new();
        cache
            .store_chunk_data("u1", &chunk("api").with_data(&b"body"[..]))
            .await
            .unwrap();

        let fetch = cache.fetch("u2", vec![chunk("api")]).await.unwrap();
        assert!(fetch.hits.is_empty());
        assert_eq!(fetch.misses.len(), 1);
    }

    #[tokio::test]
    async fn test_store_skips_bodyless_chunks() {
        let cache = MemoryCache::new();
        cache.store("tenant", &[chunk("api")]).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_injected_fetch_failure() {
        let cache = MemoryCache::new();
        cache.set_fail_fetches(true);
        cache.fetch("tenant", vec![chunk("api")]).await.unwrap_err();
    }
}
