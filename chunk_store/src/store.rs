//! Store construction, table lifecycle and the write path.

use crate::cache::ChunkCache;
use crate::config::ChunkStoreConfig;
use crate::dispatch::Dispatcher;
use crate::index::{IndexStore, IndexStoreError, TableSchema, MAX_BATCH_SIZE};
use crate::metrics::StoreMetrics;
use crate::schema;
use bytes::Bytes;
use data_types::Chunk;
use futures::future::join_all;
use metric::Registry;
use object_store::{path::Path, DynObjectStore, ObjectStore};
use observability_deps::tracing::{debug, info, warn};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid query: {}", reason))]
    BadQuery { reason: String },

    #[snafu(display("index request failed: {}", source))]
    IndexRequest { source: IndexStoreError },

    #[snafu(display("object store request failed: {}", source))]
    ObjectStoreRequest { source: object_store::Error },

    #[snafu(display("{}", source))]
    Schema { source: schema::Error },

    #[snafu(display("invalid chunk ID in index entry: {}", source))]
    InvalidChunkId { source: data_types::ChunkIdError },

    #[snafu(display("invalid inline metadata: {}", source))]
    MetadataDecode { source: serde_json::Error },
}

/// A specialized `Result` for chunk store errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A multi-tenant store of immutable metric-sample chunks.
///
/// Chunk bodies live in a blob store keyed `"<tenant>/<chunk ID>"`; an
/// inverted index in a wide-column store maps
/// `(tenant, hour, metric, label, value)` back to chunk IDs so that chunks
/// can be found by time range and label matchers. Bodies are written before
/// index entries, so an index row always points at a loadable body; the
/// reverse (a body without index rows) is unreachable garbage, not a
/// correctness problem.
#[derive(Debug)]
pub struct ChunkStore {
    pub(crate) config: ChunkStoreConfig,
    index: Arc<dyn IndexStore>,
    pub(crate) blob: Arc<DynObjectStore>,
    pub(crate) cache: Option<Arc<dyn ChunkCache>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) metrics: StoreMetrics,
}

impl ChunkStore {
    /// Create a store and spawn its dispatcher workers onto the current
    /// tokio runtime.
    pub fn new(
        config: ChunkStoreConfig,
        index: Arc<dyn IndexStore>,
        blob: Arc<DynObjectStore>,
        cache: Option<Arc<dyn ChunkCache>>,
        registry: &Registry,
    ) -> Self {
        let metrics = StoreMetrics::new(registry);
        let dispatcher = Dispatcher::new(
            Arc::clone(&index),
            config.dispatcher_workers,
            config.backoff.clone(),
            &metrics,
        );
        Self {
            config,
            index,
            blob,
            cache,
            dispatcher,
            metrics,
        }
    }

    /// Create the index table if this is the first run against the backing
    /// store.
    pub async fn create_tables_if_needed(&self) -> Result<()> {
        let tables = self.index.list_tables().await.context(IndexRequestSnafu)?;
        if tables.iter().any(|table| table == &self.config.table_name) {
            debug!(table = self.config.table_name.as_str(), "index table exists");
            return Ok(());
        }

        info!(table = self.config.table_name.as_str(), "creating index table");
        self.index
            .create_table(&TableSchema::new(&self.config.table_name))
            .await
            .context(IndexRequestSnafu)
    }

    /// Write `chunks` under `tenant`: all bodies first, concurrently, then
    /// the index entries in order-preserving batches. A body failure aborts
    /// the call before any index write, so the index never points at a
    /// body that was not durably stored.
    ///
    /// Dropping the returned future abandons the call, but index batches
    /// already handed to dispatcher workers run to completion.
    pub async fn put(&self, tenant: &str, chunks: Vec<Chunk>) -> Result<()> {
        self.write_chunk_bodies(tenant, &chunks).await?;
        self.write_index_entries(tenant, &chunks).await
    }

    /// Tear down the dispatcher, draining in-flight index operations.
    /// Idempotent; subsequent reads and writes fail.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
    }

    async fn write_chunk_bodies(&self, tenant: &str, chunks: &[Chunk]) -> Result<()> {
        let outcomes = join_all(
            chunks
                .iter()
                .map(|chunk| self.write_chunk_body(tenant, chunk)),
        )
        .await;
        gather(outcomes).map(|_| ())
    }

    async fn write_chunk_body(&self, tenant: &str, chunk: &Chunk) -> Result<()> {
        let body = chunk.data.clone().unwrap_or_else(Bytes::new);
        self.blob
            .put(&chunk_path(tenant, &chunk.id), body)
            .await
            .context(ObjectStoreRequestSnafu)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store_chunk_data(tenant, chunk).await {
                warn!(chunk = chunk.id.as_str(), %e, "failed to warm chunk cache");
            }
        }
        Ok(())
    }

    async fn write_index_entries(&self, tenant: &str, chunks: &[Chunk]) -> Result<()> {
        let mut entries = Vec::new();
        for chunk in chunks {
            let chunk_entries = schema::index_entries(tenant, chunk).context(SchemaSnafu)?;
            self.metrics
                .index_entries_per_chunk
                .record(chunk_entries.len() as u64);
            entries.extend(chunk_entries);
        }

        for batch in entries.chunks(MAX_BATCH_SIZE) {
            self.dispatcher
                .batch_put(self.config.table_name.clone(), batch.to_vec())
                .await
                .context(IndexRequestSnafu)?;
        }
        Ok(())
    }
}

/// The blob store location of a chunk body.
pub(crate) fn chunk_path(tenant: &str, chunk_id: &str) -> Path {
    Path::from(format!("{}/{}", tenant, chunk_id))
}

/// Drain a fan-out, keeping every success and the last error observed.
///
/// TODO: earlier errors are discarded; a joined multi-error would keep them.
pub(crate) fn gather<T>(outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut last_err = None;
    let mut values = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(values),
    }
}
