//! Query planning and execution.
//!
//! A query `(tenant, from, through, matchers)` decomposes into one
//! sub-query per overlapped hour bucket; within a bucket, one index scan
//! per matcher beyond the mandatory metric name. Equality matchers narrow
//! their scan to the exact `(label, value)` prefix; every other matcher
//! type scans the whole label and filters values client-side. The
//! per-matcher chunk sets are intersected by an n-way merge over their
//! ID order, bucket results are unioned and deduplicated, the time range
//! is re-checked against the bounds encoded in each chunk ID, and the
//! surviving chunks are hydrated through the cache or blob store.

use crate::index::{IndexQuery, PageToken};
use crate::metrics::StoreMetrics;
use crate::schema;
use crate::store::{
    chunk_path, gather, BadQuerySnafu, ChunkStore, IndexRequestSnafu, InvalidChunkIdSnafu,
    MetadataDecodeSnafu, ObjectStoreRequestSnafu, Result, SchemaSnafu,
};
use bytes::Bytes;
use data_types::{Chunk, MatchType, Matcher, Timestamp, METRIC_NAME_LABEL};
use futures::future::join_all;
use object_store::ObjectStore;
use observability_deps::tracing::warn;
use snafu::ResultExt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-call tallies, flushed into histograms when the call ends.
#[derive(Debug, Default)]
struct QueryLocals {
    lookups: AtomicU64,
    pages: AtomicU64,
    dropped_matches: AtomicU64,
}

impl QueryLocals {
    fn flush(&self, metrics: &StoreMetrics) {
        metrics
            .index_lookups_per_query
            .record(self.lookups.load(Ordering::Relaxed));
        metrics
            .pages_per_query
            .record(self.pages.load(Ordering::Relaxed));
        metrics
            .dropped_matches_per_query
            .record(self.dropped_matches.load(Ordering::Relaxed));
    }
}

impl ChunkStore {
    /// Fetch every chunk of `tenant` whose time range intersects
    /// `[from, through]` and whose series satisfies all `matchers`, bodies
    /// loaded, sorted by chunk ID.
    ///
    /// The matcher set must contain an equality matcher on `__name__`.
    ///
    /// Dropping the returned future abandons the query, but page requests
    /// already handed to dispatcher workers run to completion.
    pub async fn get(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[Matcher],
    ) -> Result<Vec<Chunk>> {
        if through < from {
            return BadQuerySnafu {
                reason: format!("query range end {} is before start {}", through, from),
            }
            .fail();
        }
        let (metric_name, residual) = split_metric_name_matcher(matchers)?;
        let locals = QueryLocals::default();

        let outcomes = join_all(schema::hour_buckets(from, through).map(|bucket| {
            self.query_bucket(tenant, bucket, metric_name, &residual, &locals)
        }))
        .await;
        let sets = gather(outcomes)?;

        let mut chunks: Vec<Chunk> = sets.into_iter().flatten().collect();
        sort_dedup_by_id(&mut chunks);

        // the ID carries the chunk's time bounds, so buckets that matched
        // on the hour can still be filtered down to the exact range
        chunks.retain(|chunk| chunk.overlaps(from, through));

        let chunks = self.load_chunk_bodies(tenant, chunks).await?;

        self.metrics.chunks_per_query.record(chunks.len() as u64);
        locals.flush(&self.metrics);
        Ok(chunks)
    }

    async fn query_bucket(
        &self,
        tenant: &str,
        bucket: i64,
        metric_name: &str,
        residual: &[&Matcher],
        locals: &QueryLocals,
    ) -> Result<Vec<Chunk>> {
        let hash = schema::hash_value(tenant, bucket, metric_name);

        if residual.is_empty() {
            // every row of the metric in this bucket, one per label pair;
            // collapse them to distinct chunks
            let mut chunks = self.lookup_chunks(hash, None, None, None, locals).await?;
            sort_dedup_by_id(&mut chunks);
            return Ok(chunks);
        }

        let outcomes = join_all(
            residual
                .iter()
                .map(|matcher| self.query_matcher(hash.clone(), matcher, locals)),
        )
        .await;
        let sets = gather(outcomes)?;
        Ok(intersect_by_id(sets))
    }

    async fn query_matcher(
        &self,
        hash: String,
        matcher: &Matcher,
        locals: &QueryLocals,
    ) -> Result<Vec<Chunk>> {
        let (start, end, filter) = match matcher.match_type {
            MatchType::Equal => {
                let (start, end) = schema::value_range_bounds(&matcher.name, &matcher.value);
                (start, end, None)
            }
            _ => {
                let (start, end) = schema::label_range_bounds(&matcher.name);
                (start, end, Some(matcher))
            }
        };

        let mut chunks = self
            .lookup_chunks(hash, Some(start), Some(end), filter, locals)
            .await?;
        // a whole-label scan interleaves chunk IDs across values; the
        // intersection below needs each set in ID order
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chunks)
    }

    /// Run one index scan to completion, driving the page sequence through
    /// the dispatcher and parsing rows into chunk skeletons.
    async fn lookup_chunks(
        &self,
        hash: String,
        range_start: Option<Vec<u8>>,
        range_end: Option<Vec<u8>>,
        filter: Option<&Matcher>,
        locals: &QueryLocals,
    ) -> Result<Vec<Chunk>> {
        locals.lookups.fetch_add(1, Ordering::Relaxed);
        let query = IndexQuery {
            table: self.config.table_name.clone(),
            hash,
            range_start,
            range_end,
        };

        let mut token: Option<PageToken> = None;
        let mut chunks = Vec::new();
        loop {
            let page = self
                .dispatcher
                .query_page(query.clone(), token.take())
                .await
                .context(IndexRequestSnafu)?;
            locals.pages.fetch_add(1, Ordering::Relaxed);

            for row in &page.rows {
                let key = schema::parse_range_value(&row.range).context(SchemaSnafu)?;
                if let Some(matcher) = filter {
                    if key.label != matcher.name || !matcher.matches(&key.value) {
                        locals.dropped_matches.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }

                let mut chunk = Chunk::from_id(&key.chunk_id).context(InvalidChunkIdSnafu)?;
                if let Some(metadata) = &row.value {
                    chunk.metric =
                        serde_json::from_slice(metadata).context(MetadataDecodeSnafu)?;
                    chunk.metadata_in_index = true;
                }
                chunks.push(chunk);
            }

            token = page.next;
            if token.is_none() {
                break;
            }
        }
        Ok(chunks)
    }

    /// Attach bodies to `chunks`: probe the cache, fetch misses from the
    /// blob store concurrently, and refill the cache with what was fetched.
    async fn load_chunk_bodies(&self, tenant: &str, chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let (hits, misses) = match &self.cache {
            None => (Vec::new(), chunks),
            Some(cache) => match cache.fetch(tenant, chunks.clone()).await {
                Ok(fetch) => (fetch.hits, fetch.misses),
                Err(e) => {
                    warn!(%e, "chunk cache fetch failed, falling back to the blob store");
                    (Vec::new(), chunks)
                }
            },
        };

        let outcomes = join_all(
            misses
                .iter()
                .map(|chunk| self.fetch_chunk_body(tenant, chunk)),
        )
        .await;
        let fetched = gather(outcomes)?;

        let mut chunks: Vec<Chunk> = hits.into_iter().chain(fetched).collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chunks)
    }

    async fn fetch_chunk_body(&self, tenant: &str, chunk: &Chunk) -> Result<Chunk> {
        let body = self
            .blob
            .get(&chunk_path(tenant, &chunk.id))
            .await
            .context(ObjectStoreRequestSnafu)?
            .bytes()
            .await
            .context(ObjectStoreRequestSnafu)?;

        let mut chunk = chunk.clone();
        chunk.data = Some(Bytes::from(body));

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store_chunk_data(tenant, &chunk).await {
                warn!(chunk = chunk.id.as_str(), %e, "failed to refill chunk cache");
            }
        }
        Ok(chunk)
    }
}

/// Pull the mandatory `__name__` equality matcher out of `matchers`,
/// returning the metric name and the residual matchers.
fn split_metric_name_matcher<'a>(
    matchers: &'a [Matcher],
) -> Result<(&'a str, Vec<&'a Matcher>)> {
    let mut metric_name = None;
    let mut residual = Vec::new();

    for matcher in matchers {
        if matcher.name == METRIC_NAME_LABEL {
            if matcher.match_type != MatchType::Equal {
                return BadQuerySnafu {
                    reason: format!(
                        "{} must be matched by equality, got {}",
                        METRIC_NAME_LABEL, matcher
                    ),
                }
                .fail();
            }
            if metric_name.is_some() {
                return BadQuerySnafu {
                    reason: format!("duplicate {} matcher", METRIC_NAME_LABEL),
                }
                .fail();
            }
            metric_name = Some(matcher.value.as_str());
        } else {
            residual.push(matcher);
        }
    }

    match metric_name {
        Some(metric_name) => Ok((metric_name, residual)),
        None => BadQuerySnafu {
            reason: format!("query has no {} equality matcher", METRIC_NAME_LABEL),
        }
        .fail(),
    }
}

fn sort_dedup_by_id(chunks: &mut Vec<Chunk>) {
    chunks.sort_by(|a, b| a.id.cmp(&b.id));
    chunks.dedup_by(|a, b| a.id == b.id);
}

/// Intersect ID-sorted chunk sets with an n-way merge: repeatedly align
/// every cursor on the largest ID at any head and emit when all heads
/// agree. Linear in the total size of the sets.
fn intersect_by_id(mut sets: Vec<Vec<Chunk>>) -> Vec<Chunk> {
    if sets.len() < 2 {
        return sets.pop().unwrap_or_default();
    }

    let mut cursors = vec![0usize; sets.len()];
    let mut out = Vec::new();
    loop {
        // the largest ID at any head is the only candidate for a common
        // element; an exhausted set ends the intersection
        let mut target: Option<String> = None;
        for (set, &cursor) in sets.iter().zip(cursors.iter()) {
            match set.get(cursor) {
                None => return out,
                Some(chunk) => {
                    if target
                        .as_deref()
                        .map_or(true, |target| chunk.id.as_str() > target)
                    {
                        target = Some(chunk.id.clone());
                    }
                }
            }
        }
        let target = match target {
            Some(target) => target,
            None => return out,
        };

        let mut all_match = true;
        for (set, cursor) in sets.iter().zip(cursors.iter_mut()) {
            while set
                .get(*cursor)
                .map_or(false, |chunk| chunk.id.as_str() < target.as_str())
            {
                *cursor += 1;
            }
            match set.get(*cursor) {
                None => return out,
                Some(chunk) => {
                    if chunk.id != target {
                        all_match = false;
                    }
                }
            }
        }

        if all_match {
            if let Some(chunk) = sets.first().and_then(|set| set.get(cursors[0])) {
                out.push(chunk.clone());
            }
            for cursor in &mut cursors {
                *cursor += 1;
            }
        }
    }
}
