//! In-process metric registry.
//!
//! Components register named metric families with a shared [`Registry`] and
//! obtain cheap cloneable recorders for a given set of [`Attributes`]:
//!
//! ```
//! use metric::{Metric, Registry, U64Counter};
//!
//! let registry = Registry::new();
//! let requests: Metric<U64Counter> =
//!     registry.register_metric("requests", "number of requests");
//!
//! let ok = requests.recorder(&[("status", "ok")]);
//! ok.inc(1);
//!
//! assert_eq!(ok.fetch(), 1);
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A set of key-value pairs identifying one observer within a metric family.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Set the given attribute, replacing any previous value for `key`.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Iterate over the contained key-value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_ref()))
    }
}

impl<const N: usize> From<[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: [(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k, Cow::Borrowed(v)))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self::from(pairs.as_slice())
    }
}

/// Types that can act as the per-attribute-set observer of a metric family.
pub trait MetricObserver: Debug + Clone + Send + Sync + 'static {
    /// Configuration used when creating new observers of this type.
    type Options: Debug + Clone + Send + Sync + 'static;

    /// Create a new observer.
    fn create(options: &Self::Options) -> Self;
}

/// A named metric family with one observer per distinct [`Attributes`] set.
///
/// Cloning a [`Metric`] is cheap and clones share observers.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    options: T::Options,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            options: self.options.clone(),
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str, options: T::Options) -> Self {
        Self {
            name,
            description,
            options,
            observers: Default::default(),
        }
    }

    /// The name of this metric family.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The help text of this metric family.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the observer for the given attributes, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        self.observers
            .lock()
            .entry(attributes)
            .or_insert_with(|| T::create(&self.options))
            .clone()
    }

    /// Return the observer for the given attributes if it has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// A registry of metric families, shared by all components of a process.
#[derive(Default)]
pub struct Registry {
    metrics: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("metrics", &self.metrics.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a metric family with default options, or return the existing
    /// family of the same name.
    ///
    /// Panics if `name` was previously registered with a different type:
    /// that is a programming error.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
        T::Options: Default,
    {
        self.register_metric_with_options(name, description, Default::default)
    }

    /// Register a metric family with the options produced by `options`, or
    /// return the existing family of the same name.
    pub fn register_metric_with_options<T, F>(
        &self,
        name: &'static str,
        description: &'static str,
        options: F,
    ) -> Metric<T>
    where
        T: MetricObserver,
        F: FnOnce() -> T::Options,
    {
        let mut metrics = self.metrics.lock();
        match metrics.get(name) {
            Some(existing) => existing
                .as_ref()
                .downcast_ref::<Metric<T>>()
                .unwrap_or_else(|| panic!("metric \"{}\" registered with conflicting type", name))
                .clone(),
            None => {
                let metric = Metric::<T>::new(name, description, options());
                metrics.insert(name, Box::new(metric.clone()));
                metric
            }
        }
    }
}

/// A monotonic counter of `u64` values.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    type Options = ();

    fn create(_options: &Self::Options) -> Self {
        Default::default()
    }
}

/// Bucket boundaries for a [`U64Histogram`].
#[derive(Debug, Clone)]
pub struct U64HistogramOptions {
    buckets: Vec<u64>,
}

impl U64HistogramOptions {
    /// Create options with the given inclusive upper bucket bounds.
    pub fn new(buckets: impl IntoIterator<Item = u64>) -> Self {
        let mut buckets: Vec<_> = buckets.into_iter().collect();
        buckets.sort_unstable();
        buckets.dedup();
        Self { buckets }
    }
}

impl Default for U64HistogramOptions {
    fn default() -> Self {
        Self::new([1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, u64::MAX])
    }
}

/// One bucket of a histogram observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationBucket {
    /// Inclusive upper bound of this bucket.
    pub le: u64,
    /// Number of recorded values that fell into this bucket.
    pub count: u64,
}

/// A point-in-time snapshot of a histogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramObservation {
    /// The non-cumulative per-bucket counts.
    pub buckets: Vec<ObservationBucket>,
    /// Sum of all recorded values.
    pub total: u64,
}

impl HistogramObservation {
    /// Total number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }
}

#[derive(Debug)]
struct HistogramData {
    buckets: Vec<ObservationBucket>,
    total: u64,
}

/// A histogram of `u64` values.
#[derive(Debug, Clone)]
pub struct U64Histogram {
    shared: Arc<Mutex<HistogramData>>,
}

impl U64Histogram {
    /// Record a single value.
    ///
    /// Values beyond the last bucket bound are counted in the last bucket.
    pub fn record(&self, value: u64) {
        let mut data = self.shared.lock();
        data.total = data.total.wrapping_add(value);
        let index = data
            .buckets
            .iter()
            .position(|bucket| value <= bucket.le)
            .unwrap_or_else(|| data.buckets.len().saturating_sub(1));
        if let Some(bucket) = data.buckets.get_mut(index) {
            bucket.count += 1;
        }
    }

    /// Snapshot the current state.
    pub fn fetch(&self) -> HistogramObservation {
        let data = self.shared.lock();
        HistogramObservation {
            buckets: data.buckets.clone(),
            total: data.total,
        }
    }
}

impl MetricObserver for U64Histogram {
    type Options = U64HistogramOptions;

    fn create(options: &Self::Options) -> Self {
        Self {
            shared: Arc::new(Mutex::new(HistogramData {
                buckets: options
                    .buckets
                    .iter()
                    .map(|&le| ObservationBucket { le, count: 0 })
                    .collect(),
                total: 0,
            })),
        }
    }
}

/// Bucket boundaries for a [`DurationHistogram`].
#[derive(Debug, Clone)]
pub struct DurationHistogramOptions {
    buckets: Vec<Duration>,
}

impl DurationHistogramOptions {
    /// Create options with the given inclusive upper bucket bounds.
    pub fn new(buckets: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            buckets: buckets.into_iter().collect(),
        }
    }
}

impl Default for DurationHistogramOptions {
    fn default() -> Self {
        Self::new([
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(25),
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(250),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_millis(2500),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::MAX,
        ])
    }
}

/// A histogram of [`Duration`]s, recorded with nanosecond granularity.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    inner: U64Histogram,
}

impl DurationHistogram {
    /// Record a single duration.
    pub fn record(&self, duration: Duration) {
        self.inner
            .record(duration.as_nanos().try_into().unwrap_or(u64::MAX));
    }

    /// Snapshot the current state; bucket bounds and total are nanoseconds.
    pub fn fetch(&self) -> HistogramObservation {
        self.inner.fetch()
    }

    /// Total number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.fetch().sample_count()
    }
}

impl MetricObserver for DurationHistogram {
    type Options = DurationHistogramOptions;

    fn create(options: &Self::Options) -> Self {
        Self {
            inner: U64Histogram::create(&U64HistogramOptions::new(options.buckets.iter().map(
                |duration| duration.as_nanos().try_into().unwrap_or(u64::MAX),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_per_attributes() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("requests", "request count");

        let ok = metric.recorder(&[("status", "ok")]);
        let err = metric.recorder(&[("status", "error")]);

        ok.inc(2);
        err.inc(1);
        ok.inc(1);

        assert_eq!(ok.fetch(), 3);
        assert_eq!(err.fetch(), 1);

        // recorders for the same attributes share state
        let ok2 = metric.recorder(&[("status", "ok")]);
        ok2.inc(1);
        assert_eq!(ok.fetch(), 4);

        assert_eq!(
            metric
                .get_observer(&Attributes::from(&[("status", "error")]))
                .unwrap()
                .fetch(),
            1
        );
        assert!(metric
            .get_observer(&Attributes::from(&[("status", "missing")]))
            .is_none());
    }

    #[test]
    fn test_reregister_returns_same_family() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        let b: Metric<U64Counter> = registry.register_metric("hits", "hit count");

        a.recorder(&[("kind", "x")]).inc(1);
        assert_eq!(b.recorder(&[("kind", "x")]).fetch(), 1);
    }

    #[test]
    #[should_panic(expected = "conflicting type")]
    fn test_reregister_conflicting_type_panics() {
        let registry = Registry::new();
        let _: Metric<U64Counter> = registry.register_metric("hits", "hit count");
        let _: Metric<U64Histogram> = registry.register_metric("hits", "hit count");
    }

    #[test]
    fn test_u64_histogram_buckets() {
        let registry = Registry::new();
        let metric: Metric<U64Histogram> = registry.register_metric_with_options(
            "batch_sizes",
            "entries per batch",
            || U64HistogramOptions::new([1, 10, 100]),
        );

        let histogram = metric.recorder(&[("op", "put")]);
        histogram.record(1);
        histogram.record(5);
        histogram.record(99);
        // beyond the last bound lands in the last bucket
        histogram.record(500);

        let observation = histogram.fetch();
        assert_eq!(
            observation.buckets,
            vec![
                ObservationBucket { le: 1, count: 1 },
                ObservationBucket { le: 10, count: 1 },
                ObservationBucket { le: 100, count: 2 },
            ]
        );
        assert_eq!(observation.total, 605);
        assert_eq!(observation.sample_count(), 4);
    }

    #[test]
    fn test_duration_histogram() {
        let registry = Registry::new();
        let metric: Metric<DurationHistogram> =
            registry.register_metric("request_duration", "request latency");

        let histogram = metric.recorder(&[("op", "query"), ("status", "ok")]);
        histogram.record(Duration::from_millis(20));
        histogram.record(Duration::from_secs(3));

        assert_eq!(histogram.sample_count(), 2);
        assert_eq!(
            histogram.fetch().total,
            Duration::from_millis(3020).as_nanos() as u64
        );
    }

    #[test]
    fn test_attributes_insert_owned() {
        let mut attributes = Attributes::from(&[("op", "query")]);
        attributes.insert("reason", "throttled".to_string());

        assert_eq!(
            attributes.iter().collect::<Vec<_>>(),
            vec![("op", "query"), ("reason", "throttled")]
        );
    }
}
