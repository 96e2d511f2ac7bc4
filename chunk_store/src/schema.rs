//! The index key schema.
//!
//! Every stored chunk is exploded into one index row per hour bucket it
//! overlaps per `(label, value)` pair of its series (the metric name is
//! carried by the hash key instead). Rows live in a wide-column table with
//! a two-part primary key:
//!
//! - hash key: `"<tenant>:<hour bucket>:<metric name>"`, which selects a
//!   partition and bounds every scan to one tenant, one metric and one hour;
//! - range key: `label \0 value \0 chunk ID \0`. The fields are
//!   NUL-terminated, so byte-wise comparison of two range keys agrees with
//!   lexicographic comparison of the underlying tuples and prefix scans are
//!   plain range scans. Fields must therefore not contain NUL bytes.

use crate::index::IndexEntry;
use data_types::{Chunk, Timestamp};
use snafu::{OptionExt, ResultExt, Snafu};
use std::ops::RangeInclusive;

/// Seconds covered by one hash-key shard.
const BUCKET_SECONDS: i64 = 3_600;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("chunk {:?} has no metric name label", id))]
    MissingMetricName { id: String },

    #[snafu(display("range key is not three NUL-terminated fields"))]
    MalformedRangeKey,

    #[snafu(display("range key field is not valid UTF-8: {}", source))]
    RangeKeyUtf8 { source: std::str::Utf8Error },

    #[snafu(display("cannot encode label metadata for chunk {:?}: {}", id, source))]
    MetadataEncode {
        id: String,
        source: serde_json::Error,
    },
}

/// The hour bucket containing `t`.
pub fn bucket(t: Timestamp) -> i64 {
    t.unix_seconds().div_euclid(BUCKET_SECONDS)
}

/// All hour buckets a `[from, through]` range overlaps.
pub fn hour_buckets(from: Timestamp, through: Timestamp) -> RangeInclusive<i64> {
    bucket(from)..=bucket(through)
}

/// The hash key of all index rows for one tenant, bucket and metric.
pub fn hash_value(tenant: &str, bucket: i64, metric_name: &str) -> String {
    format!("{}:{}:{}", tenant, bucket, metric_name)
}

/// Encode a `(label, value, chunk ID)` tuple as an order-preserving range
/// key. The fields must not contain NUL bytes.
pub fn range_value(label: &str, value: &str, chunk_id: &str) -> Vec<u8> {
    debug_assert!(
        !label.as_bytes().contains(&0)
            && !value.as_bytes().contains(&0)
            && !chunk_id.as_bytes().contains(&0),
        "range key fields must be NUL free"
    );
    join_fields(&[label.as_bytes(), value.as_bytes(), chunk_id.as_bytes()])
}

fn join_fields(fields: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.iter().map(|field| field.len() + 1).sum());
    for field in fields {
        out.extend_from_slice(field);
        out.push(0);
    }
    out
}

/// A decoded range key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKey {
    /// Label name.
    pub label: String,
    /// Label value.
    pub value: String,
    /// External chunk ID.
    pub chunk_id: String,
}

/// Decode a range key produced by [`range_value`].
pub fn parse_range_value(bytes: &[u8]) -> Result<RangeKey, Error> {
    let fields: Vec<&[u8]> = bytes.split(|b| *b == 0).collect();
    // a well-formed key splits into three fields plus a trailing empty one
    match fields.as_slice() {
        [label, value, chunk_id, rest] if rest.is_empty() => Ok(RangeKey {
            label: std::str::from_utf8(label).context(RangeKeyUtf8Snafu)?.to_string(),
            value: std::str::from_utf8(value).context(RangeKeyUtf8Snafu)?.to_string(),
            chunk_id: std::str::from_utf8(chunk_id)
                .context(RangeKeyUtf8Snafu)?
                .to_string(),
        }),
        _ => MalformedRangeKeySnafu.fail(),
    }
}

/// The smallest byte string strictly greater than `s` with the same length,
/// used as the open upper bound of prefix scans. Callers pass non-empty
/// strings.
///
/// TODO: incrementing the final byte does not carry, so a field whose last
/// byte is 0xff yields a non-monotone bound.
pub fn successor(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        *last = last.wrapping_add(1);
    }
    bytes
}

/// Scan bounds `[start, end)` selecting every row whose label and value
/// equal the given pair, across all chunk IDs.
pub fn value_range_bounds(label: &str, value: &str) -> (Vec<u8>, Vec<u8>) {
    (
        range_value(label, value, ""),
        join_fields(&[label.as_bytes(), &successor(value), b""]),
    )
}

/// Scan bounds `[start, end)` selecting every row of the given label,
/// across all values; the caller filters values client-side.
pub fn label_range_bounds(label: &str) -> (Vec<u8>, Vec<u8>) {
    (
        range_value(label, "", ""),
        join_fields(&[&successor(label), b"", b""]),
    )
}

/// Explode a chunk into its index rows: one per overlapped hour bucket per
/// non-`__name__` label pair, each carrying the JSON-encoded label set as
/// inline metadata.
pub fn index_entries(tenant: &str, chunk: &Chunk) -> Result<Vec<IndexEntry>, Error> {
    let metric_name = chunk
        .metric
        .metric_name()
        .context(MissingMetricNameSnafu { id: chunk.id.as_str() })?;
    let metadata =
        serde_json::to_vec(&chunk.metric).context(MetadataEncodeSnafu { id: chunk.id.as_str() })?;

    let mut entries = Vec::new();
    for bucket in hour_buckets(chunk.from, chunk.through) {
        let hash = hash_value(tenant, bucket, metric_name);
        for (label, value) in chunk.metric.without_metric_name() {
            entries.push(IndexEntry {
                hash: hash.clone(),
                range: range_value(label, value, &chunk.id),
                value: Some(metadata.clone()),
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::Labels;
    use proptest::prelude::*;

    #[test]
    fn test_bucket() {
        assert_eq!(bucket(Timestamp::from_unix_seconds(0)), 0);
        assert_eq!(bucket(Timestamp::from_unix_seconds(3_599)), 0);
        assert_eq!(bucket(Timestamp::from_unix_seconds(3_600)), 1);
        assert_eq!(bucket(Timestamp::from_unix_seconds(-1)), -1);
        assert_eq!(bucket(Timestamp::from_unix_millis(3_599_999)), 0);
    }

    #[test]
    fn test_hour_buckets() {
        let buckets: Vec<_> = hour_buckets(
            Timestamp::from_unix_seconds(3_590),
            Timestamp::from_unix_seconds(3_610),
        )
        .collect();
        assert_eq!(buckets, vec![0, 1]);
    }

    #[test]
    fn test_hash_value() {
        assert_eq!(hash_value("tenant", 42, "requests"), "tenant:42:requests");
    }

    #[test]
    fn test_range_value_round_trip() {
        let encoded = range_value("job", "api", "abc:1:2");
        assert_eq!(
            parse_range_value(&encoded).unwrap(),
            RangeKey {
                label: "job".to_string(),
                value: "api".to_string(),
                chunk_id: "abc:1:2".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_range_value_rejects_garbage() {
        assert!(matches!(
            parse_range_value(b"no-separators").unwrap_err(),
            Error::MalformedRangeKey
        ));
        assert!(matches!(
            parse_range_value(b"a\0b\0").unwrap_err(),
            Error::MalformedRangeKey
        ));
        assert!(matches!(
            parse_range_value(b"a\0b\0c\0d\0").unwrap_err(),
            Error::MalformedRangeKey
        ));
        assert!(matches!(
            parse_range_value(b"\xff\xfe\0b\0c\0").unwrap_err(),
            Error::RangeKeyUtf8 { .. }
        ));
    }

    #[test]
    fn test_ordering_of_prefixes() {
        // "aa" sorts before "b" as a string, and so must the encodings
        let a = range_value("aa", "", "");
        let b = range_value("b", "", "");
        assert!(a < b);
    }

    #[test]
    fn test_successor() {
        assert_eq!(successor("a"), b"b".to_vec());
        assert_eq!(successor("job"), b"joc".to_vec());
        assert_eq!(successor(""), Vec::<u8>::new());
        // multi-byte characters increment their final UTF-8 byte
        let s = successor("é");
        assert_eq!(s.len(), 2);
        assert!(s.as_slice() > "é".as_bytes());
    }

    #[test]
    fn test_value_range_bounds_select_exact_value() {
        let (start, end) = value_range_bounds("job", "api");

        let matching = range_value("job", "api", "some-chunk");
        let other_value = range_value("job", "web", "some-chunk");
        let prefix_value = range_value("job", "apiserver", "some-chunk");
        let other_label = range_value("env", "api", "some-chunk");

        assert!(start <= matching && matching < end);
        assert!(!(start <= other_value && other_value < end));
        assert!(!(start <= prefix_value && prefix_value < end));
        assert!(!(start <= other_label && other_label < end));
    }

    #[test]
    fn test_label_range_bounds_select_all_values() {
        let (start, end) = label_range_bounds("job");

        for value in ["", "api", "web", "zzz"] {
            let key = range_value("job", value, "some-chunk");
            assert!(start <= key && key < end, "value {:?} not covered", value);
        }
        let other_label = range_value("jobs", "api", "some-chunk");
        assert!(!(start <= other_label && other_label < end));
    }

    fn test_chunk() -> Chunk {
        Chunk::new(
            Labels::from([("__name__", "requests"), ("env", "prod"), ("job", "api")]),
            Timestamp::from_unix_seconds(3_590),
            Timestamp::from_unix_seconds(3_610),
        )
    }

    #[test]
    fn test_index_entries() {
        let chunk = test_chunk();
        let entries = index_entries("tenant", &chunk).unwrap();

        // two buckets times two non-name labels
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries.iter().map(|e| e.hash.as_str()).collect::<Vec<_>>(),
            vec![
                "tenant:0:requests",
                "tenant:0:requests",
                "tenant:1:requests",
                "tenant:1:requests"
            ]
        );

        let key = parse_range_value(&entries[0].range).unwrap();
        assert_eq!(key.label, "env");
        assert_eq!(key.value, "prod");
        assert_eq!(key.chunk_id, chunk.id);

        // inline metadata carries the full label set
        let metadata: Labels =
            serde_json::from_slice(entries[0].value.as_ref().unwrap()).unwrap();
        assert_eq!(metadata, chunk.metric);
    }

    #[test]
    fn test_index_entries_require_metric_name() {
        let chunk = Chunk::new(
            Labels::from([("job", "api")]),
            Timestamp::from_unix_seconds(0),
            Timestamp::from_unix_seconds(1),
        );
        assert!(matches!(
            index_entries("tenant", &chunk).unwrap_err(),
            Error::MissingMetricName { .. }
        ));
    }

    #[test]
    fn test_index_entries_name_only_series_has_no_rows() {
        let chunk = Chunk::new(
            Labels::from([("__name__", "requests")]),
            Timestamp::from_unix_seconds(0),
            Timestamp::from_unix_seconds(1),
        );
        assert!(index_entries("tenant", &chunk).unwrap().is_empty());
    }

    fn nul_free() -> impl Strategy<Value = String> {
        "[^\\x00]{0,8}"
    }

    proptest! {
        #[test]
        fn prop_range_value_round_trips(
            label in nul_free(),
            value in nul_free(),
            chunk_id in nul_free(),
        ) {
            let encoded = range_value(&label, &value, &chunk_id);
            let key = parse_range_value(&encoded).unwrap();
            prop_assert_eq!(key.label, label);
            prop_assert_eq!(key.value, value);
            prop_assert_eq!(key.chunk_id, chunk_id);
        }

        #[test]
        fn prop_range_value_preserves_order(
            a in (nul_free(), nul_free(), nul_free()),
            b in (nul_free(), nul_free(), nul_free()),
        ) {
            let encoded_a = range_value(&a.0, &a.1, &a.2);
            let encoded_b = range_value(&b.0, &b.1, &b.2);
            prop_assert_eq!(a.cmp(&b), encoded_a.cmp(&encoded_b));
        }
    }
}
