//! Capability-based client for the wide-column store backing the inverted
//! index.
//!
//! The rest of the crate depends only on [`IndexStore`]; implementations
//! are interchangeable. [`mock::MemIndexStore`] is the in-memory variant
//! used by tests and embedded setups; an adapter wrapping a vendor SDK
//! implements the same trait against the real service.

use async_trait::async_trait;
use std::fmt::{Debug, Display, Formatter};

/// Service cap on entries per batched index write.
pub const MAX_BATCH_SIZE: usize = 25;

/// Generic boxed error type that is used by [`IndexStore`] implementations.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// implementations; the kind is what the dispatcher's retry policy keys on.
#[derive(Debug)]
pub struct IndexStoreError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: IndexStoreErrorKind,
}

impl IndexStoreError {
    pub fn new(
        kind: IndexStoreErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    pub fn throttled(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(IndexStoreErrorKind::Throttled, e)
    }

    pub fn invalid_request(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(IndexStoreErrorKind::InvalidRequest, e)
    }

    pub fn io(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(IndexStoreErrorKind::Io, e)
    }

    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(IndexStoreErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was
    pub fn kind(&self) -> IndexStoreErrorKind {
        self.kind
    }

    /// Returns the inner error
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }

    /// True if this is the capacity-exceeded signal the dispatcher retries.
    pub fn is_throttled(&self) -> bool {
        self.kind == IndexStoreErrorKind::Throttled
    }
}

impl Display for IndexStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndexStoreError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for IndexStoreError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexStoreErrorKind {
    /// The service rejected the request because provisioned capacity was
    /// exceeded. Retried with backoff, never surfaced to callers.
    Throttled,

    /// The request itself was malformed (unknown table, oversized batch).
    InvalidRequest,

    /// A fatal transport error occurred.
    Io,

    /// This operation failed for an unknown reason.
    Unknown,
}

impl IndexStoreErrorKind {
    /// Stable label used by failure counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::InvalidRequest => "invalid_request",
            Self::Io => "io",
            Self::Unknown => "other",
        }
    }
}

/// One row of the inverted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Hash key.
    pub hash: String,
    /// Range key.
    pub range: Vec<u8>,
    /// Optional inline payload (JSON-encoded label set).
    pub value: Option<Vec<u8>>,
}

/// Table shape and provisioned capacity used for lazy table creation.
///
/// The column layout is fixed: a string hash key `h`, a binary range key
/// `r`, and an optional binary payload `c`; only the name and capacity
/// vary per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Provisioned read capacity units.
    pub read_capacity_units: u64,
    /// Provisioned write capacity units.
    pub write_capacity_units: u64,
}

impl TableSchema {
    /// A table with the default modest capacity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_capacity_units: 10,
            write_capacity_units: 5,
        }
    }
}

/// A single-partition range query against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    /// Table to query.
    pub table: String,
    /// Hash key selecting the partition.
    pub hash: String,
    /// Inclusive lower bound on the range key; `None` scans from the start.
    pub range_start: Option<Vec<u8>>,
    /// Exclusive upper bound on the range key; `None` scans to the end.
    pub range_end: Option<Vec<u8>>,
}

/// Opaque continuation token; `None` from [`IndexPage::next`] ends the
/// page sequence.
pub type PageToken = Vec<u8>;

/// One row returned by a query page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    /// Range key bytes.
    pub range: Vec<u8>,
    /// Optional inline payload.
    pub value: Option<Vec<u8>>,
}

/// One page of a paged query. A logical query is a lazy finite sequence of
/// pages; the caller re-submits with [`IndexPage::next`] until it is `None`.
#[derive(Debug, Clone)]
pub struct IndexPage {
    /// The rows of this page, in range-key order.
    pub rows: Vec<IndexRow>,
    /// Continuation token for the next page, if any.
    pub next: Option<PageToken>,
    /// Capacity units consumed serving this page.
    pub consumed_capacity: u64,
}

/// The capability set the index store must provide.
#[async_trait]
pub trait IndexStore: Debug + Send + Sync + 'static {
    /// List existing tables, used as the lifecycle probe before creation.
    async fn list_tables(&self) -> Result<Vec<String>, IndexStoreError>;

    /// Create a table. Callers check [`list_tables`](Self::list_tables)
    /// first; creation of an existing table may fail.
    async fn create_table(&self, schema: &TableSchema) -> Result<(), IndexStoreError>;

    /// Write a batch of entries atomically, returning the consumed write
    /// capacity. Callers must respect [`MAX_BATCH_SIZE`].
    ///
    /// TODO: a partially throttled batch reports per-item leftovers on the
    /// wire; those are currently folded into a whole-batch failure instead
    /// of being resubmitted.
    async fn batch_put(&self, table: &str, entries: &[IndexEntry])
        -> Result<u64, IndexStoreError>;

    /// Fetch one page of a query, continuing from `token` if given.
    async fn query_page(
        &self,
        query: &IndexQuery,
        token: Option<&PageToken>,
    ) -> Result<IndexPage, IndexStoreError>;

    /// Return type (like `"mem"`) of this store.
    fn type_name(&self) -> &'static str;
}

pub mod mock {
    //! In-memory [`IndexStore`] for tests and embedded setups.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    type Table = BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>;

    #[derive(Debug, Default)]
    struct MemState {
        tables: BTreeMap<String, Table>,
        observed_batch_sizes: Vec<usize>,
        throttle_remaining: usize,
        queries_in_flight: usize,
        max_queries_in_flight: usize,
    }

    /// An ordered-map index store. Beyond implementing [`IndexStore`] it
    /// records what it observed (batch sizes, concurrent queries) and can
    /// be told to throttle, which is what the dispatcher and write-path
    /// tests are built on.
    #[derive(Debug)]
    pub struct MemIndexStore {
        state: Arc<Mutex<MemState>>,
        page_size: usize,
        query_delay: Option<Duration>,
    }

    impl Default for MemIndexStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemIndexStore {
        pub fn new() -> Self {
            Self {
                state: Default::default(),
                page_size: 100,
                query_delay: None,
            }
        }

        /// Cap the number of rows returned per query page.
        pub fn with_page_size(mut self, page_size: usize) -> Self {
            self.page_size = page_size;
            self
        }

        /// Hold every query for `delay` while it counts as in-flight.
        pub fn with_query_delay(mut self, delay: Duration) -> Self {
            self.query_delay = Some(delay);
            self
        }

        /// Fail the next `n` batch puts with a throttling error.
        pub fn throttle_next_batch_puts(&self, n: usize) {
            self.state.lock().throttle_remaining = n;
        }

        /// Entry counts of every batch put observed, in order.
        pub fn observed_batch_sizes(&self) -> Vec<usize> {
            self.state.lock().observed_batch_sizes.clone()
        }

        /// High-water mark of concurrently executing queries.
        pub fn max_queries_in_flight(&self) -> usize {
            self.state.lock().max_queries_in_flight
        }

        /// Number of rows in `table`.
        pub fn row_count(&self, table: &str) -> usize {
            self.state
                .lock()
                .tables
                .get(table)
                .map(|t| t.len())
                .unwrap_or_default()
        }

        /// The distinct hash values present in `table`, in order.
        pub fn hash_values(&self, table: &str) -> Vec<String> {
            let state = self.state.lock();
            let mut hashes: Vec<String> = state
                .tables
                .get(table)
                .map(|t| t.keys().map(|(hash, _)| hash.clone()).collect())
                .unwrap_or_default();
            hashes.dedup();
            hashes
        }
    }

    #[async_trait]
    impl IndexStore for MemIndexStore {
        async fn list_tables(&self) -> Result<Vec<String>, IndexStoreError> {
            Ok(self.state.lock().tables.keys().cloned().collect())
        }

        async fn create_table(&self, schema: &TableSchema) -> Result<(), IndexStoreError> {
            self.state
                .lock()
                .tables
                .entry(schema.name.clone())
                .or_default();
            Ok(())
        }

        async fn batch_put(
            &self,
            table: &str,
            entries: &[IndexEntry],
        ) -> Result<u64, IndexStoreError> {
            let mut state = self.state.lock();
            state.observed_batch_sizes.push(entries.len());

            if entries.len() > MAX_BATCH_SIZE {
                return Err(IndexStoreError::invalid_request(format!(
                    "batch of {} entries exceeds the cap of {}",
                    entries.len(),
                    MAX_BATCH_SIZE
                )));
            }
            if state.throttle_remaining > 0 {
                state.throttle_remaining -= 1;
                return Err(IndexStoreError::throttled(
                    "provisioned throughput exceeded",
                ));
            }

            let table = state.tables.get_mut(table).ok_or_else(|| {
                IndexStoreError::invalid_request(format!("table {:?} does not exist", table))
            })?;
            for entry in entries {
                table.insert((entry.hash.clone(), entry.range.clone()), entry.value.clone());
            }
            Ok(entries.len() as u64)
        }

        async fn query_page(
            &self,
            query: &IndexQuery,
            token: Option<&PageToken>,
        ) -> Result<IndexPage, IndexStoreError> {
            {
                let mut state = self.state.lock();
                state.queries_in_flight += 1;
                state.max_queries_in_flight =
                    state.max_queries_in_flight.max(state.queries_in_flight);
            }

            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }

            let result = {
                let state = self.state.lock();
                match state.tables.get(&query.table) {
                    None => Err(IndexStoreError::invalid_request(format!(
                        "table {:?} does not exist",
                        query.table
                    ))),
                    Some(table) => {
                        let mut rows: Vec<IndexRow> = table
                            .iter()
                            .filter(|((hash, range), _)| {
                                hash == &query.hash
                                    && query.range_start.as_ref().map_or(true, |s| range >= s)
                                    && query.range_end.as_ref().map_or(true, |e| range < e)
                                    && token.map_or(true, |t| range > t)
                            })
                            .take(self.page_size + 1)
                            .map(|((_, range), value)| IndexRow {
                                range: range.clone(),
                                value: value.clone(),
                            })
                            .collect();

                        let next = if rows.len() > self.page_size {
                            rows.truncate(self.page_size);
                            rows.last().map(|row| row.range.clone())
                        } else {
                            None
                        };
                        Ok(IndexPage {
                            rows,
                            next,
                            consumed_capacity: 1,
                        })
                    }
                }
            };

            self.state.lock().queries_in_flight -= 1;
            result
        }

        fn type_name(&self) -> &'static str {
            "mem"
        }
    }

}
