//! Batch key-rotation job definitions.
//!
//! Jobs arrive as YAML:
//!
//! ```yaml
//! apiVersion: v1
//! bucket: BUCKET
//! prefix: PREFIX
//! encryption:
//!   type: sse-kms            # sse-s3 or sse-kms
//!   key: <new-kms-key>       # sse-kms only
//!   context: <base64-json>   # sse-kms only
//! flags:
//!   filter:
//!     newerThan: "7d"        # e.g. 7d10h31s
//!     olderThan: "7d"
//!     createdAfter: "2024-01-01T00:00:00Z"
//!     createdBefore: "2024-06-01T00:00:00Z"
//!     tags:
//!       - key: "name"
//!         value: "pick*"
//!     metadata:
//!       - key: "content-type"
//!         value: "image/*"
//!     kmskey: "key-id"
//!   notify:
//!     endpoint: "https://notify.example"
//!     token: "Bearer xxxxx"
//!   retry:
//!     attempts: 10
//!     delay: "500ms"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skerry_io::{is_sse_kms, is_sse_s3, strip_arn};
use skerry_object::services::{Kms, KmsContext};
use skerry_object::{BucketOptions, ObjectLayer};
use skerry_types::{is_standard_header, FileInfo, META_OBJECT_TAGGING, META_SSE_KMS_KEY_ID};

use crate::BatchError;

/// Required `apiVersion` of v1 key-rotation jobs.
pub const KEY_ROTATE_API_VERSION: &str = "v1";

/// Default per-object retry attempts.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

/// Default delay between job retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Synthetic context used when trial-encrypting during validation.
pub fn validation_context() -> KmsContext {
    KmsContext::from([("Skerry batch API".to_string(), "batchrotate".to_string())])
}

/// A key/value pair used by the tag and metadata filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotateKV {
    /// Key to match, case-insensitive.
    #[serde(default)]
    pub key: String,
    /// Value pattern; shell-glob (`*`, `?`), case-sensitive.
    #[serde(default)]
    pub value: String,
}

impl KeyRotateKV {
    /// Filter keys must be non-empty.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.key.is_empty() {
            return Err(BatchError::InvalidArgument);
        }
        Ok(())
    }

    /// Whether this KV is unset.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.value.is_empty()
    }

    /// Match an input pair: keys compare case-insensitively, values by
    /// shell glob.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        if !self.key.eq_ignore_ascii_case(key) {
            return false;
        }
        match glob::Pattern::new(&self.value) {
            Ok(pattern) => pattern.matches(value),
            Err(_) => self.value == value,
        }
    }
}

/// Per-object retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotateRetry {
    /// Attempts per object before giving up.
    #[serde(default)]
    pub attempts: usize,
    /// Minimum delay before the job is retried after failure.
    #[serde(default, with = "duration_str")]
    pub delay: Option<Duration>,
}

impl KeyRotateRetry {
    /// Attempts and delay must be non-negative; zero means defaults.
    pub fn validate(&self) -> Result<(), BatchError> {
        // Unsigned fields make negatives unrepresentable; a malformed
        // duration string already failed deserialization.
        Ok(())
    }
}

/// Target encryption flavor of a rotation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRotationType {
    /// Internally managed keys.
    #[serde(rename = "sse-s3")]
    SseS3,
    /// KMS-managed KEK.
    #[serde(rename = "sse-kms")]
    SseKms,
}

/// Target encryption options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotateEncryption {
    /// Target flavor.
    #[serde(rename = "type")]
    pub kind: KeyRotationType,
    /// New KMS key ID (sse-kms only). May carry an ARN prefix.
    #[serde(default)]
    pub key: String,
    /// New KMS context, base64-encoded JSON (sse-kms only).
    #[serde(default)]
    pub context: String,
}

impl KeyRotateEncryption {
    /// Decode the configured KMS context.
    pub fn kms_context(&self) -> Result<KmsContext, BatchError> {
        if self.context.is_empty() {
            return Ok(KmsContext::new());
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.context)
            .map_err(|_| BatchError::InvalidArgument)?;
        serde_json::from_slice(&raw).map_err(|_| BatchError::InvalidArgument)
    }

    /// Validate the target, trial-encrypting against the KMS.
    pub async fn validate(
        &self,
        kms: Option<&std::sync::Arc<dyn skerry_object::services::Kms>>,
    ) -> Result<(), BatchError> {
        let padded = self.key.starts_with(' ') || self.key.ends_with(' ');
        if self.kind == KeyRotationType::SseKms && padded {
            return Err(BatchError::InvalidKmsKeyId(self.key.clone()));
        }
        if self.kind == KeyRotationType::SseKms {
            let Some(kms) = kms else {
                return Err(BatchError::KmsNotConfigured);
            };
            let mut ctx = self.kms_context()?;
            ctx.extend(validation_context());
            kms.generate_key(strip_arn(&self.key), &ctx)
                .await
                .map_err(BatchError::Kms)?;
        }
        Ok(())
    }
}

/// Candidate-object filters. Evaluated in declaration order; the first
/// negative short-circuits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotateFilter {
    /// Keep only objects at least this old.
    #[serde(default, with = "duration_str")]
    pub older_than: Option<Duration>,
    /// Keep only objects younger than this.
    #[serde(default, with = "duration_str")]
    pub newer_than: Option<Duration>,
    /// Keep only objects modified at or after this instant.
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    /// Keep only objects modified at or before this instant.
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    /// Keep only objects where any KV matches any object tag.
    #[serde(default)]
    pub tags: Vec<KeyRotateKV>,
    /// Keep only objects where any KV matches a metadata header.
    #[serde(default)]
    pub metadata: Vec<KeyRotateKV>,
    /// Keep only objects sealed under this KMS key (ARN-stripped).
    #[serde(default, rename = "kmskeyid", alias = "kmskey")]
    pub kms_key_id: String,
}

impl KeyRotateFilter {
    /// Push-down walk filter: `true` keeps the entry.
    pub fn matches(&self, info: &FileInfo, now: DateTime<Utc>) -> bool {
        let mod_time = info.mod_time.unwrap_or(now);
        let age = now.signed_duration_since(mod_time);

        if let Some(older_than) = self.older_than {
            let older_than = chrono::Duration::from_std(older_than).unwrap_or_default();
            if age < older_than {
                return false;
            }
        }
        if let Some(newer_than) = self.newer_than {
            let newer_than = chrono::Duration::from_std(newer_than).unwrap_or_default();
            if age >= newer_than {
                return false;
            }
        }
        if let Some(created_after) = self.created_after {
            if mod_time < created_after {
                return false;
            }
        }
        if let Some(created_before) = self.created_before {
            if mod_time > created_before {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let tag_map = parse_object_tags(info.metadata.get(META_OBJECT_TAGGING));
            let any = self.tags.iter().any(|kv| {
                tag_map
                    .iter()
                    .any(|(key, value)| kv.matches(key, value))
            });
            if !any {
                return false;
            }
        }

        if !self.metadata.is_empty() {
            let any = self.metadata.iter().any(|kv| {
                info.metadata.iter().any(|(key, value)| {
                    let lowered = key.to_ascii_lowercase();
                    if !lowered.starts_with("x-amz-meta-") && !is_standard_header(&lowered) {
                        return false;
                    }
                    kv.matches(key, value)
                })
            });
            if !any {
                return false;
            }
        }

        if !self.kms_key_id.is_empty() {
            if let Some(id) = info.metadata.get(META_SSE_KMS_KEY_ID) {
                if strip_arn(id) != self.kms_key_id {
                    return false;
                }
            }
        }

        true
    }
}

/// Parse the URL-encoded tag string stored in object metadata.
fn parse_object_tags(raw: Option<&String>) -> BTreeMap<String, String> {
    match raw {
        None => BTreeMap::new(),
        Some(raw) => form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    }
}

/// Job-status notification target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRotateNotification {
    /// HTTP endpoint POSTed the final job info.
    #[serde(default)]
    pub endpoint: String,
    /// Optional `Authorization` value.
    #[serde(default)]
    pub token: String,
}

/// Optional job configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRotateFlags {
    /// Candidate filters.
    #[serde(default)]
    pub filter: KeyRotateFilter,
    /// Completion notification.
    #[serde(default)]
    pub notify: KeyRotateNotification,
    /// Retry policy.
    #[serde(default)]
    pub retry: KeyRotateRetry,
}

/// v1 batch key-rotation job definition. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotateJob {
    /// Must be [`KEY_ROTATE_API_VERSION`].
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Bucket to walk.
    pub bucket: String,
    /// Key prefix to restrict the walk to.
    #[serde(default)]
    pub prefix: String,
    /// Target encryption.
    pub encryption: KeyRotateEncryption,
    /// Filters, notification and retry.
    #[serde(default)]
    pub flags: KeyRotateFlags,
}

impl KeyRotateJob {
    /// Parse a YAML job definition.
    pub fn from_yaml(raw: &str) -> Result<Self, BatchError> {
        serde_yaml::from_str(raw).map_err(|e| BatchError::Definition(e.to_string()))
    }

    /// Validate the definition against the live deployment.
    pub async fn validate(
        &self,
        layer: &dyn ObjectLayer,
        kms: Option<&std::sync::Arc<dyn skerry_object::services::Kms>>,
    ) -> Result<(), BatchError> {
        if self.api_version != KEY_ROTATE_API_VERSION {
            return Err(BatchError::InvalidArgument);
        }
        if self.bucket.is_empty() {
            return Err(BatchError::InvalidArgument);
        }
        if let Err(e) = layer
            .get_bucket_info(&self.bucket, BucketOptions::default())
            .await
        {
            if matches!(e, skerry_object::ObjectError::BucketNotFound { .. }) {
                return Err(BatchError::JobError {
                    code: "NoSuchSourceBucket",
                    description: "The specified source bucket does not exist".to_string(),
                    status: 404,
                });
            }
            return Err(BatchError::Object(e));
        }
        if kms.is_none() {
            return Err(BatchError::KmsNotConfigured);
        }
        self.encryption.validate(kms).await?;

        for tag in &self.flags.filter.tags {
            tag.validate()?;
        }
        for kv in &self.flags.filter.metadata {
            kv.validate()?;
        }
        self.flags.retry.validate()?;
        Ok(())
    }

    /// Effective per-object attempt count.
    pub fn retry_attempts(&self) -> usize {
        match self.flags.retry.attempts {
            0 => DEFAULT_RETRY_ATTEMPTS,
            n => n,
        }
    }

    /// Effective inter-retry delay.
    pub fn retry_delay(&self) -> Duration {
        self.flags.retry.delay.unwrap_or(DEFAULT_RETRY_DELAY)
    }

    /// Whether a walked object is even a rotation candidate: only SSE-S3
    /// or SSE-KMS objects are.
    pub fn is_candidate(metadata: &BTreeMap<String, String>) -> bool {
        is_sse_s3(metadata) || is_sse_kms(metadata)
    }
}

/// Duration strings in job YAML: `250ms`, `30s`, `7d10h31s`.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            None => serializer.serialize_none(),
            Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw}"))),
        }
    }

    /// Parse compound duration strings: `7d10h31s`, `500ms`, `90m`.
    pub(crate) fn parse(raw: &str) -> Option<Duration> {
        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() || c == '.' {
                digits.push(c);
                continue;
            }
            let unit = if c == 'm' && chars.peek() == Some(&'s') {
                chars.next();
                "ms"
            } else {
                match c {
                    'd' => "d",
                    'h' => "h",
                    'm' => "m",
                    's' => "s",
                    _ => return None,
                }
            };
            let value: f64 = digits.parse().ok()?;
            digits.clear();
            let seconds = match unit {
                "d" => value * 86_400.0,
                "h" => value * 3_600.0,
                "m" => value * 60.0,
                "s" => value,
                _ => value / 1_000.0,
            };
            total += Duration::from_secs_f64(seconds);
        }
        if !digits.is_empty() {
            return None; // trailing number without a unit
        }
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_definition_parses() {
        let job = KeyRotateJob::from_yaml(
            r#"
apiVersion: v1
bucket: photos
prefix: "2024/"
encryption:
  type: sse-kms
  key: arn:aws:kms:new-key
  context: ""
flags:
  filter:
    olderThan: "7d"
    tags:
      - key: "team"
        value: "infra*"
    kmskeyid: old-key
  notify:
    endpoint: "https://notify.example"
    token: "Bearer abc"
  retry:
    attempts: 5
    delay: "500ms"
"#,
        )
        .unwrap();
        assert_eq!(job.api_version, "v1");
        assert_eq!(job.encryption.kind, KeyRotationType::SseKms);
        assert_eq!(job.flags.retry.attempts, 5);
        assert_eq!(job.retry_delay(), Duration::from_millis(500));
        assert_eq!(
            job.flags.filter.older_than,
            Some(Duration::from_secs(7 * 86_400))
        );
        assert_eq!(job.flags.filter.kms_key_id, "old-key");
    }

    #[test]
    fn compound_durations_parse() {
        assert_eq!(
            duration_str::parse("7d10h31s"),
            Some(Duration::from_secs(7 * 86_400 + 10 * 3_600 + 31))
        );
        assert_eq!(duration_str::parse("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(duration_str::parse("90m"), Some(Duration::from_secs(5_400)));
        assert_eq!(duration_str::parse("oops"), None);
        assert_eq!(duration_str::parse("12"), None);
    }

    #[test]
    fn kv_matching_is_key_insensitive_value_glob() {
        let kv = KeyRotateKV {
            key: "Content-Type".into(),
            value: "image/*".into(),
        };
        assert!(kv.matches("content-type", "image/png"));
        assert!(!kv.matches("content-type", "video/mp4"));
        assert!(!kv.matches("content-length", "image/png"));
        // Values are case-sensitive.
        assert!(!kv.matches("content-type", "IMAGE/png"));
    }

    fn fi(metadata: &[(&str, &str)], age_days: i64) -> FileInfo {
        FileInfo {
            name: "obj".into(),
            mod_time: Some(Utc::now() - chrono::Duration::days(age_days)),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn age_filters_short_circuit() {
        let filter = KeyRotateFilter {
            older_than: Some(Duration::from_secs(5 * 86_400)),
            ..Default::default()
        };
        assert!(filter.matches(&fi(&[], 10), Utc::now()));
        assert!(!filter.matches(&fi(&[], 1), Utc::now()));

        let filter = KeyRotateFilter {
            newer_than: Some(Duration::from_secs(5 * 86_400)),
            ..Default::default()
        };
        assert!(filter.matches(&fi(&[], 1), Utc::now()));
        assert!(!filter.matches(&fi(&[], 10), Utc::now()));
    }

    #[test]
    fn created_window_filters() {
        let now = Utc::now();
        let filter = KeyRotateFilter {
            created_after: Some(now - chrono::Duration::days(5)),
            created_before: Some(now - chrono::Duration::days(1)),
            ..Default::default()
        };
        assert!(filter.matches(&fi(&[], 3), now));
        assert!(!filter.matches(&fi(&[], 7), now));
        assert!(!filter.matches(&fi(&[], 0), now));
    }

    #[test]
    fn tag_filter_matches_any_configured_kv() {
        let filter = KeyRotateFilter {
            tags: vec![
                KeyRotateKV {
                    key: "team".into(),
                    value: "infra".into(),
                },
                KeyRotateKV {
                    key: "tier".into(),
                    value: "hot*".into(),
                },
            ],
            ..Default::default()
        };
        let tagged = fi(&[(META_OBJECT_TAGGING, "tier=hottest&owner=ops")], 1);
        assert!(filter.matches(&tagged, Utc::now()));

        let untagged = fi(&[], 1);
        assert!(!filter.matches(&untagged, Utc::now()));
    }

    #[test]
    fn metadata_filter_only_considers_meta_and_standard_headers() {
        let filter = KeyRotateFilter {
            metadata: vec![KeyRotateKV {
                key: "content-type".into(),
                value: "image/*".into(),
            }],
            ..Default::default()
        };
        assert!(filter.matches(&fi(&[("content-type", "image/png")], 1), Utc::now()));
        assert!(!filter.matches(&fi(&[("x-internal-thing", "image/png")], 1), Utc::now()));

        let meta_filter = KeyRotateFilter {
            metadata: vec![KeyRotateKV {
                key: "x-amz-meta-origin".into(),
                value: "browser".into(),
            }],
            ..Default::default()
        };
        assert!(meta_filter.matches(&fi(&[("x-amz-meta-origin", "browser")], 1), Utc::now()));
    }

    #[test]
    fn kms_key_filter_uses_stripped_ids() {
        let filter = KeyRotateFilter {
            kms_key_id: "key-1".into(),
            ..Default::default()
        };
        assert!(filter.matches(
            &fi(&[(META_SSE_KMS_KEY_ID, "arn:aws:kms:key-1")], 1),
            Utc::now()
        ));
        assert!(!filter.matches(&fi(&[(META_SSE_KMS_KEY_ID, "key-2")], 1), Utc::now()));
        // No KMS metadata at all still matches, per the filter contract.
        assert!(filter.matches(&fi(&[], 1), Utc::now()));
    }
}
