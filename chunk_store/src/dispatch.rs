//! Bounded-concurrency executor for remote index operations.
//!
//! A fixed pool of workers consumes submitted operations from a rendezvous
//! channel, so at most `worker_count` index requests are in flight at any
//! instant, store-wide. Workers own the retry policy: a throttled operation
//! sleeps and is re-sent with exponentially growing delays, and the delay is
//! never reset within one operation. Every other error is returned to the
//! submitter immediately.

use crate::index::{IndexEntry, IndexPage, IndexQuery, IndexStore, IndexStoreError, PageToken};
use crate::metrics::StoreMetrics;
use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

#[derive(Debug)]
enum IndexOp {
    BatchPut {
        table: String,
        entries: Vec<IndexEntry>,
    },
    QueryPage {
        query: IndexQuery,
        token: Option<PageToken>,
    },
}

impl IndexOp {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchPut { .. } => "batch_put",
            Self::QueryPage { .. } => "query_page",
        }
    }
}

#[derive(Debug)]
enum IndexOpOutput {
    Wrote,
    Page(IndexPage),
}

#[derive(Debug)]
struct DispatchedRequest {
    op: IndexOp,
    done: oneshot::Sender<Result<IndexOpOutput, IndexStoreError>>,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    tx: parking_lot::Mutex<Option<mpsc::Sender<DispatchedRequest>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `worker_count` workers onto the current tokio runtime.
    pub(crate) fn new(
        index: Arc<dyn IndexStore>,
        worker_count: usize,
        backoff_config: BackoffConfig,
        metrics: &StoreMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let rx = Arc::new(AsyncMutex::new(rx));

        let workers = (0..worker_count)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let index = Arc::clone(&index);
                let backoff_config = backoff_config.clone();
                let metrics = metrics.clone();
                tokio::spawn(worker_loop(rx, index, backoff_config, metrics))
            })
            .collect();

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Write one batch of index entries, waiting for its final outcome.
    pub(crate) async fn batch_put(
        &self,
        table: String,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexStoreError> {
        match self.submit(IndexOp::BatchPut { table, entries }).await? {
            IndexOpOutput::Wrote => Ok(()),
            IndexOpOutput::Page(_) => {
                Err(IndexStoreError::unknown("batch put returned a query page"))
            }
        }
    }

    /// Fetch one query page, waiting for its final outcome.
    pub(crate) async fn query_page(
        &self,
        query: IndexQuery,
        token: Option<PageToken>,
    ) -> Result<IndexPage, IndexStoreError> {
        match self.submit(IndexOp::QueryPage { query, token }).await? {
            IndexOpOutput::Page(page) => Ok(page),
            IndexOpOutput::Wrote => {
                Err(IndexStoreError::unknown("query page returned a write ack"))
            }
        }
    }

    async fn submit(&self, op: IndexOp) -> Result<IndexOpOutput, IndexStoreError> {
        let tx = match &*self.tx.lock() {
            Some(tx) => tx.clone(),
            None => return Err(IndexStoreError::invalid_request("dispatcher is stopped")),
        };

        let (done, done_rx) = oneshot::channel();
        tx.send(DispatchedRequest { op, done })
            .await
            .map_err(|_| IndexStoreError::invalid_request("dispatcher is stopped"))?;
        done_rx
            .await
            .map_err(|_| IndexStoreError::unknown("dispatcher worker dropped the request"))?
    }

    /// Close the submission channel, let every worker drain its in-flight
    /// request, and wait for all of them to exit. Idempotent.
    pub(crate) async fn stop(&self) {
        self.tx.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(%e, "dispatcher worker panicked");
            }
        }
        info!("index dispatcher stopped");
    }
}

async fn worker_loop(
    rx: Arc<AsyncMutex<mpsc::Receiver<DispatchedRequest>>>,
    index: Arc<dyn IndexStore>,
    backoff_config: BackoffConfig,
    metrics: StoreMetrics,
) {
    loop {
        let request = { rx.lock().await.recv().await };
        let DispatchedRequest { op, done } = match request {
            Some(request) => request,
            // channel closed and drained
            None => break,
        };

        let result = execute_with_backoff(index.as_ref(), &op, &backoff_config, &metrics).await;
        // the submitter may have been dropped; nothing to do then
        let _ = done.send(result);
    }
}

async fn execute_with_backoff(
    index: &dyn IndexStore,
    op: &IndexOp,
    backoff_config: &BackoffConfig,
    metrics: &StoreMetrics,
) -> Result<IndexOpOutput, IndexStoreError> {
    let mut backoff = Backoff::new(backoff_config);

    loop {
        let start = Instant::now();
        let result = match op {
            IndexOp::BatchPut { table, entries } => index
                .batch_put(table, entries)
                .await
                .map(|capacity| (capacity, IndexOpOutput::Wrote)),
            IndexOp::QueryPage { query, token } => {
                index.query_page(query, token.as_ref()).await.map(|page| {
                    let capacity = page.consumed_capacity;
                    (capacity, IndexOpOutput::Page(page))
                })
            }
        };
        let elapsed = start.elapsed();

        match result {
            Ok((capacity, output)) => {
                metrics.record_request(op.name(), "ok", elapsed);
                metrics.record_capacity(op.name(), capacity);
                return Ok(output);
            }
            Err(e) if e.is_throttled() => {
                metrics.record_request(op.name(), "throttled", elapsed);
                metrics.record_failure(op.name(), "throttled");
                let delay = backoff.next();
                debug!(
                    op = op.name(),
                    delay_ms = delay.as_millis() as u64,
                    "index operation throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                metrics.record_request(op.name(), "error", elapsed);
                metrics.record_failure(op.name(), e.kind().as_str());
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{mock::MemIndexStore, IndexStoreErrorKind, TableSchema};
    use metric::Registry;
    use std::time::Duration;

    async fn dispatcher_over(
        index: Arc<MemIndexStore>,
        worker_count: usize,
    ) -> (Dispatcher, Registry) {
        index
            .create_table(&TableSchema::new("index"))
            .await
            .unwrap();
        let registry = Registry::new();
        let metrics = StoreMetrics::new(&registry);
        let dispatcher = Dispatcher::new(
            index,
            worker_count,
            BackoffConfig::default(),
            &metrics,
        );
        (dispatcher, registry)
    }

    fn entries(n: usize) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| IndexEntry {
                hash: "h".to_string(),
                range: format!("r{:03}", i).into_bytes(),
                value: None,
            })
            .collect()
    }

    fn query() -> IndexQuery {
        IndexQuery {
            table: "index".to_string(),
            hash: "h".to_string(),
            range_start: None,
            range_end: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_request_is_retried_with_growing_delays() {
        let index = Arc::new(MemIndexStore::new());
        let (dispatcher, registry) = dispatcher_over(Arc::clone(&index), 2).await;

        index.throttle_next_batch_puts(3);

        let started = tokio::time::Instant::now();
        dispatcher
            .batch_put("index".to_string(), entries(1))
            .await
            .unwrap();

        // three throttled attempts back off for 100ms, 200ms and 400ms
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(index.observed_batch_sizes().len(), 4);
        assert_eq!(index.row_count("index"), 1);

        let throttles = registry
            .register_metric::<metric::U64Counter>(
                "index_request_errors_total",
                "index request failures by operation and reason",
            )
            .get_observer(&metric::Attributes::from(&[
                ("op", "batch_put"),
                ("reason", "throttled"),
            ]))
            .unwrap()
            .fetch();
        assert_eq!(throttles, 3);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_non_throttling_errors_surface_immediately() {
        let index = Arc::new(MemIndexStore::new());
        let (dispatcher, _registry) = dispatcher_over(Arc::clone(&index), 2).await;

        let err = dispatcher
            .batch_put("no_such_table".to_string(), entries(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), IndexStoreErrorKind::InvalidRequest);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_worker_pool_caps_concurrency() {
        let index = Arc::new(
            MemIndexStore::new().with_query_delay(Duration::from_millis(5)),
        );
        let (dispatcher, _registry) = dispatcher_over(Arc::clone(&index), 4).await;
        dispatcher
            .batch_put("index".to_string(), entries(10))
            .await
            .unwrap();

        let lookups = (0..16).map(|_| dispatcher.query_page(query(), None));
        let pages = futures::future::join_all(lookups).await;
        for page in pages {
            assert_eq!(page.unwrap().rows.len(), 10);
        }

        assert!(index.max_queries_in_flight() <= 4);
        assert!(index.max_queries_in_flight() >= 1);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_requests() {
        let index = Arc::new(
            MemIndexStore::new().with_query_delay(Duration::from_millis(10)),
        );
        let (dispatcher, _registry) = dispatcher_over(Arc::clone(&index), 1).await;
        let dispatcher = Arc::new(dispatcher);
        dispatcher
            .batch_put("index".to_string(), entries(1))
            .await
            .unwrap();

        let in_flight = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.query_page(query(), None).await })
        };
        // let the request reach a worker before shutting down
        while index.max_queries_in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher.stop().await;

        let page = in_flight.await.unwrap().unwrap();
        assert_eq!(page.rows.len(), 1);

        // submissions after stop fail cleanly, and stop is idempotent
        let err = dispatcher.query_page(query(), None).await.unwrap_err();
        assert_eq!(err.kind(), IndexStoreErrorKind::InvalidRequest);
        dispatcher.stop().await;
    }
}
