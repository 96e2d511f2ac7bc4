//! Shared data types for the chunk store: time instants, label sets,
//! chunks and their external IDs, and label matchers.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// The label under which a series' metric name is stored.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A millisecond-precision instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from milliseconds since the unix epoch.
    pub fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from seconds since the unix epoch.
    pub fn from_unix_seconds(seconds: i64) -> Self {
        Self(seconds * 1_000)
    }

    /// Milliseconds since the unix epoch.
    pub fn unix_millis(&self) -> i64 {
        self.0
    }

    /// Whole seconds since the unix epoch, rounding towards negative
    /// infinity so pre-epoch instants bucket consistently.
    pub fn unix_seconds(&self) -> i64 {
        self.0.div_euclid(1_000)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sorted mapping from label name to label value describing one series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Create an empty label set.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set a label, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// The value of the given label, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// The metric name, i.e. the value of the `__name__` label.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Iterate over all `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterate over all pairs except `__name__`.
    pub fn without_metric_name(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.iter().filter(|(name, _)| *name != METRIC_NAME_LABEL)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no labels are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A stable 64-bit fingerprint of the full label set.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for (name, value) in self.iter() {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        hasher.digest()
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Labels {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

/// Errors parsing an external chunk ID.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ChunkIdError {
    #[snafu(display("chunk ID {:?} is not of the form fingerprint:from:through", id))]
    MalformedChunkId { id: String },

    #[snafu(display("chunk ID {:?} has an invalid fingerprint: {}", id, source))]
    InvalidFingerprint {
        id: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("chunk ID {:?} has an invalid time bound: {}", id, source))]
    InvalidTimeBound {
        id: String,
        source: std::num::ParseIntError,
    },
}

/// An immutable block of encoded samples for one series over one time range.
///
/// The body (`data`) is opaque to the store; encoding and decoding happen
/// in the caller. `metadata_in_index` records that the label set was
/// recovered from an inline index payload rather than the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// External ID, also the blob-store key suffix. Encodes the
    /// fingerprint and both time bounds; see [`Chunk::from_id`].
    pub id: String,
    /// First sample instant covered by this chunk.
    pub from: Timestamp,
    /// Last sample instant covered by this chunk.
    pub through: Timestamp,
    /// The series labels, including `__name__`.
    pub metric: Labels,
    /// The encoded body, if loaded.
    pub data: Option<Bytes>,
    /// True if `metric` was carried by the index entry itself.
    pub metadata_in_index: bool,
}

impl Chunk {
    /// Create a chunk for the given series and time range. The external ID
    /// is derived from the label fingerprint and the time bounds.
    pub fn new(metric: Labels, from: Timestamp, through: Timestamp) -> Self {
        let id = format!(
            "{:016x}:{}:{}",
            metric.fingerprint(),
            from.unix_millis(),
            through.unix_millis()
        );
        Self {
            id,
            from,
            through,
            metric,
            data: None,
            metadata_in_index: false,
        }
    }

    /// Reconstruct a chunk skeleton from its external ID, recovering the
    /// time bounds. Labels and body are left empty.
    pub fn from_id(id: &str) -> Result<Self, ChunkIdError> {
        let mut parts = id.splitn(3, ':');
        let fingerprint = parts.next().context(MalformedChunkIdSnafu { id })?;
        let from = parts.next().context(MalformedChunkIdSnafu { id })?;
        let through = parts.next().context(MalformedChunkIdSnafu { id })?;

        u64::from_str_radix(fingerprint, 16).context(InvalidFingerprintSnafu { id })?;
        let from = from
            .parse::<i64>()
            .context(InvalidTimeBoundSnafu { id })?;
        let through = through
            .parse::<i64>()
            .context(InvalidTimeBoundSnafu { id })?;

        Ok(Self {
            id: id.to_string(),
            from: Timestamp::from_unix_millis(from),
            through: Timestamp::from_unix_millis(through),
            metric: Labels::new(),
            data: None,
            metadata_in_index: false,
        })
    }

    /// True if this chunk's time range intersects `[from, through]`.
    pub fn overlaps(&self, from: Timestamp, through: Timestamp) -> bool {
        self.through >= from && self.from <= through
    }

    /// Attach an encoded body.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// The comparison a [`Matcher`] applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Exact equality. The only type that permits index range narrowing.
    Equal,
    /// Exact inequality.
    NotEqual,
    /// Regular expression match, fully anchored.
    Regex,
    /// Negated regular expression match, fully anchored.
    NotRegex,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        };
        write!(f, "{}", s)
    }
}

/// Errors constructing a [`Matcher`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum MatcherError {
    #[snafu(display("invalid regular expression {:?}: {}", pattern, source))]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// A predicate over a single label's value.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// The comparison to apply.
    pub match_type: MatchType,
    /// The label this matcher inspects.
    pub name: String,
    /// The value or pattern compared against.
    pub value: String,
    regex: Option<regex::Regex>,
}

impl Matcher {
    /// Create a matcher; regex types compile `value` fully anchored.
    pub fn new(
        match_type: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, MatcherError> {
        let name = name.into();
        let value = value.into();
        let regex = match match_type {
            MatchType::Equal | MatchType::NotEqual => None,
            MatchType::Regex | MatchType::NotRegex => Some(
                regex::Regex::new(&format!("^(?:{})$", value))
                    .context(InvalidRegexSnafu { pattern: value.as_str() })?,
            ),
        };
        Ok(Self {
            match_type,
            name,
            value,
            regex,
        })
    }

    /// Apply the predicate to a label value.
    pub fn matches(&self, value: &str) -> bool {
        // regex types always carry a compiled regex
        let regex_matches = || {
            self.regex
                .as_ref()
                .map_or(false, |regex| regex.is_match(value))
        };
        match self.match_type {
            MatchType::Equal => value == self.value,
            MatchType::NotEqual => value != self.value,
            MatchType::Regex => regex_matches(),
            MatchType::NotRegex => !regex_matches(),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}
