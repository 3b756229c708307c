//! Fan-out uploader: one buffered input, many destination objects.
//!
//! The client uploads plaintext exactly once; re-reading any destination
//! would be a copy of a copy (and could leak plaintext through caches),
//! so the input is materialized in memory before the first write and
//! every destination is written from the same buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use skerry_object::{ObjectError, ObjectInfo, ObjectLayer, ObjectOptions};

/// One destination of a fan-out request, from the
/// `x-skerry-fanout-list` form field.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FanOutEntry {
    /// Destination object key.
    #[serde(rename = "key", alias = "Key")]
    pub key: String,
    /// Per-entry metadata, merged over the form metadata.
    #[serde(rename = "metadata", alias = "UserMetadata", default)]
    pub metadata: BTreeMap<String, String>,
}

/// One line of the NDJSON fan-out response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutResponse {
    /// Destination key this line reports on.
    #[serde(rename = "key")]
    pub key: String,
    /// ETag of the written object.
    #[serde(rename = "etag", skip_serializing_if = "String::is_empty")]
    pub etag: String,
    /// Version ID when versioning is enabled.
    #[serde(rename = "versionId", skip_serializing_if = "String::is_empty")]
    pub version_id: String,
    /// Last-modified timestamp, RFC 3339.
    #[serde(rename = "lastModified", skip_serializing_if = "String::is_empty")]
    pub last_modified: String,
    /// Error message when the write failed; errors are per-entry and do
    /// not abort siblings.
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fan-out batch width: bounded by hardware parallelism, capped at 100.
pub(crate) fn fanout_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.clamp(1, 100)
}

/// Write one batch of destinations concurrently from the shared buffer.
///
/// Returns one result per entry, in entry order. A per-entry failure is
/// local; sibling writes in the batch proceed.
pub(crate) async fn put_batch(
    layer: Arc<dyn ObjectLayer>,
    bucket: &str,
    entries: &[FanOutEntry],
    data: Bytes,
    base_metadata: &BTreeMap<String, String>,
) -> Vec<(String, Result<ObjectInfo, ObjectError>)> {
    let mut tasks = Vec::with_capacity(entries.len());
    for entry in entries {
        let layer = layer.clone();
        let bucket = bucket.to_string();
        let key = entry.key.clone();
        let data = data.clone();

        let mut metadata = base_metadata.clone();
        for (k, v) in &entry.metadata {
            metadata.insert(k.clone(), v.clone());
        }

        // Each write runs on its own task so a client disconnect cannot
        // cancel an in-flight write mid-object.
        tasks.push(tokio::spawn(async move {
            let opts = ObjectOptions {
                user_defined: metadata,
                ..Default::default()
            };
            let mut reader = data.as_ref();
            let result = layer.put_object(&bucket, &key, &mut reader, &opts).await;
            (key, result)
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(entry) => results.push(entry),
            Err(e) => results.push((
                String::new(),
                Err(ObjectError::Storage(skerry_storage::StorageError::Other(
                    e.to_string(),
                ))),
            )),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_entry_accepts_both_casings() {
        let entry: FanOutEntry = serde_json::from_str(r#"{"key":"a/b"}"#).unwrap();
        assert_eq!(entry.key, "a/b");

        let entry: FanOutEntry =
            serde_json::from_str(r#"{"Key":"c","UserMetadata":{"x-amz-meta-tier":"hot"}}"#)
                .unwrap();
        assert_eq!(entry.key, "c");
        assert_eq!(entry.metadata.get("x-amz-meta-tier").unwrap(), "hot");
    }

    #[test]
    fn response_lines_omit_empty_fields() {
        let ok = FanOutResponse {
            key: "k1".into(),
            etag: "abc".into(),
            ..Default::default()
        };
        let line = serde_json::to_string(&ok).unwrap();
        assert!(line.contains("\"etag\""));
        assert!(!line.contains("error"));

        let failed = FanOutResponse {
            key: "k2".into(),
            error: Some("disk path full".into()),
            ..Default::default()
        };
        let line = serde_json::to_string(&failed).unwrap();
        assert!(line.contains("\"error\""));
        assert!(!line.contains("etag"));
    }

    #[test]
    fn concurrency_is_bounded() {
        let w = fanout_concurrency();
        assert!(w >= 1);
        assert!(w <= 100);
    }
}
