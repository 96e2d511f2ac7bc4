//! The instruments exported by the store.

use metric::{
    Attributes, DurationHistogram, Metric, Registry, U64Counter, U64Histogram,
};
use std::time::Duration;

/// All instruments, registered once at store construction and handed to the
/// components that record into them.
#[derive(Debug, Clone)]
pub(crate) struct StoreMetrics {
    request_duration: Metric<DurationHistogram>,
    consumed_capacity: Metric<U64Counter>,
    request_errors: Metric<U64Counter>,

    pub(crate) index_entries_per_chunk: U64Histogram,
    pub(crate) chunks_per_query: U64Histogram,
    pub(crate) index_lookups_per_query: U64Histogram,
    pub(crate) pages_per_query: U64Histogram,
    pub(crate) dropped_matches_per_query: U64Histogram,
}

impl StoreMetrics {
    pub(crate) fn new(registry: &Registry) -> Self {
        let histogram = |name, description| {
            registry
                .register_metric::<U64Histogram>(name, description)
                .recorder(Attributes::default())
        };

        Self {
            request_duration: registry.register_metric(
                "index_request_duration",
                "distribution of index request latencies by operation and status",
            ),
            consumed_capacity: registry.register_metric(
                "index_consumed_capacity_total",
                "capacity units consumed by index operations",
            ),
            request_errors: registry.register_metric(
                "index_request_errors_total",
                "index request failures by operation and reason",
            ),
            index_entries_per_chunk: histogram(
                "index_entries_per_chunk",
                "number of index rows written per chunk",
            ),
            chunks_per_query: histogram(
                "chunks_per_query",
                "number of chunks returned per query",
            ),
            index_lookups_per_query: histogram(
                "index_lookups_per_query",
                "number of index lookups issued per query",
            ),
            pages_per_query: histogram(
                "index_pages_per_query",
                "number of index pages consumed per query",
            ),
            dropped_matches_per_query: histogram(
                "dropped_matches_per_query",
                "number of scanned rows dropped by client-side matching per query",
            ),
        }
    }

    pub(crate) fn record_request(
        &self,
        op: &'static str,
        status: &'static str,
        elapsed: Duration,
    ) {
        self.request_duration
            .recorder([("op", op), ("status", status)])
            .record(elapsed);
    }

    pub(crate) fn record_capacity(&self, op: &'static str, capacity: u64) {
        self.consumed_capacity.recorder([("op", op)]).inc(capacity);
    }

    pub(crate) fn record_failure(&self, op: &'static str, reason: &'static str) {
        self.request_errors
            .recorder([("op", op), ("reason", reason)])
            .inc(1);
    }
}
