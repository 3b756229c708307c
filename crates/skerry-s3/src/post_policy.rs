//! Browser-based uploads: `POST /{bucket}` with a signed policy form.
//!
//! The multipart form carries the signed policy (base64 JSON), the
//! destination key, metadata fields, optionally a fan-out list, and —
//! always last — the file content. Non-file fields are capped at 10 MiB
//! combined and 1000 parts.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use skerry_io::{
    ContentChecksum, EncryptReader, HardLimitReader, HashReader, SseKind, MAX_FANOUT_SIZE,
    MAX_POST_SIZE,
};
use skerry_object::services::{
    action, AuthArgs, BucketMetadataSys, Kms, KmsContext, PolicyEngine, VersioningSys,
};
use skerry_object::{ObjectLayer, ObjectOptions, EXCESSIVE_VERSIONS_THRESHOLD};
use skerry_types::events::{ObjectCreatedPost, ObjectManyVersions};
use skerry_types::{is_standard_header, META_SSE_ALGORITHM};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::info;

use crate::error::{to_api_error, ApiError};
use crate::fanout::{self, FanOutEntry, FanOutResponse};
use crate::handlers::{header_str, AuditScope};
use crate::{AppState, MAX_FORM_MEMORY, MAX_FORM_PARTS};

/// Form field naming the fan-out destination list.
const FANOUT_LIST_FIELD: &str = "x-skerry-fanout-list";

/// Collected non-file form state.
#[derive(Default)]
struct PostForm {
    /// Field values keyed by lowercase name.
    values: BTreeMap<String, String>,
    /// Parsed fan-out destinations, when the field was present.
    fanout: Vec<FanOutEntry>,
}

impl PostForm {
    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Handle `POST /{bucket}` (browser upload, possibly fan-out).
pub(crate) async fn post_policy_handler(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    let audit = AuditScope::new("PostPolicyBucket", bucket);
    let layer = state.layer()?;

    // SSE-KMS via request headers is not supported on POST.
    if header_str(headers, "x-amz-server-side-encryption") == Some("aws:kms") {
        return Err(ApiError::not_implemented().bucket(bucket));
    }

    let request = Request::builder()
        .header(
            header::CONTENT_TYPE,
            header_str(headers, header::CONTENT_TYPE.as_str()).unwrap_or(""),
        )
        .body(body)
        .expect("request reconstruction cannot fail");
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;

    let mut form = PostForm::default();
    let mut parts_left = MAX_FORM_PARTS;
    let mut memory_left = MAX_FORM_MEMORY as i64;

    // Non-file fields are buffered; the file itself must be the last
    // field and is consumed streaming.
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return Err(ApiError::malformed_post_request()
                    .because("The file or text content is missing")
                    .bucket(bucket));
            }
            Err(e) => {
                return Err(ApiError::malformed_post_request().because(e).bucket(bucket));
            }
        };
        if parts_left == 0 {
            return Err(ApiError::malformed_post_request()
                .because("too many form parts")
                .bucket(bucket));
        }
        parts_left -= 1;

        let Some(name) = field.name().map(str::to_ascii_lowercase) else {
            continue;
        };

        if field.file_name().is_some() {
            // The file part: everything after it is ignored per the S3
            // POST contract.
            let file_name = field.file_name().unwrap_or_default().to_string();
            return finish_upload(state, bucket, headers, layer, form, field, file_name, audit)
                .await;
        }

        let text = field
            .text()
            .await
            .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;

        if name == FANOUT_LIST_FIELD {
            form.fanout = serde_json::from_str(&text)
                .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
            continue;
        }

        memory_left -= text.len() as i64 + name.len() as i64;
        if memory_left < 0 {
            return Err(ApiError::malformed_post_request()
                .because("message too large")
                .bucket(bucket));
        }
        form.values.insert(name, text);
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_upload(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    layer: std::sync::Arc<dyn ObjectLayer>,
    form: PostForm,
    field: axum::extract::multipart::Field<'_>,
    file_name: String,
    audit: AuditScope,
) -> Result<Response<Body>, ApiError> {
    let Some(key_template) = form.get("key") else {
        return Err(ApiError::malformed_post_request()
            .because("The name of the uploaded key is missing")
            .bucket(bucket));
    };

    // `${filename}` in the key is replaced by the uploaded file's name.
    let object = key_template
        .replace("${filename}", &file_name)
        .trim_start_matches('/')
        .to_string();

    let checksum = ContentChecksum::from_headers(|name| form.get(name))
        .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
    if let Some(checksum) = &checksum {
        if checksum.trailing {
            return Err(ApiError::malformed_post_request()
                .because("Trailing checksums not available for POST operations")
                .bucket(bucket));
        }
    }

    let success_redirect = form.get("success_action_redirect").map(str::to_string);
    let success_status = form.get("success_action_status").unwrap_or("").to_string();

    // Verify the policy signature; the credential fields identify the
    // signer.
    let signer = form
        .get("x-amz-credential")
        .or_else(|| form.get("awsaccesskeyid"))
        .map(str::to_string);
    let (cred, is_owner) = state
        .services
        .iam
        .authenticate(signer.as_deref())
        .map_err(ApiError::from)?;

    let act = if form.fanout.is_empty() {
        action::PUT_OBJECT
    } else {
        action::PUT_OBJECT_FAN_OUT
    };
    let allowed = state.services.iam.is_allowed(&AuthArgs {
        action: act,
        bucket,
        object: &object,
        credential: &cred,
        conditions: BTreeMap::new(),
        is_owner,
    });
    if !allowed {
        return Err(ApiError::access_denied().bucket(bucket).object(&object));
    }

    // Evaluate the signed policy document against the form.
    let mut length_range = None;
    if let Some(policy_b64) = form.get("policy") {
        if !policy_b64.is_empty() {
            let policy_bytes = base64::engine::general_purpose::STANDARD
                .decode(policy_b64)
                .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
            let policy = PostPolicy::parse(&policy_bytes)
                .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
            policy
                .check(&form, bucket)
                .map_err(|e| ApiError::access_denied().because(e).bucket(bucket))?;
            length_range = policy.content_length_range;
        }
    }

    // Metadata from the form: x-amz-meta-* plus standard headers.
    let mut metadata: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &form.values {
        if name.starts_with("x-amz-meta-") || is_standard_header(name) {
            metadata.insert(name.clone(), value.clone());
        }
    }

    // SSE selection from the form.
    let sse = sse_from_form(&form)?;
    match &sse {
        Some(SseSelection::C { .. }) => {
            if state.services.bucket_meta.replication_enabled(bucket).await {
                return Err(to_api_error(
                    skerry_object::ObjectError::InvalidEncryptionParametersSsec,
                    bucket,
                    &object,
                ));
            }
            if !form.fanout.is_empty() {
                // SSE-C fan-out would re-derive the client key per entry.
                return Err(ApiError::not_implemented().bucket(bucket).object(&object));
            }
        }
        Some(_) if state.services.kms.is_none() => {
            return Err(ApiError::kms_not_configured().bucket(bucket));
        }
        _ => {}
    }

    // Field implements Stream; pinning makes the adapter Unpin for the
    // reader stack.
    let body_stream =
        StreamReader::new(Box::pin(field.map_err(|e| std::io::Error::other(e.to_string()))));

    if !form.fanout.is_empty() {
        let fanout_sse = match sse {
            None => None,
            Some(SseSelection::S3) => Some((SseKind::S3, String::new(), KmsContext::new())),
            Some(SseSelection::Kms { key_id, context }) => {
                Some((SseKind::Kms, key_id, context))
            }
            // Rejected above; repeated so the match stays exhaustive.
            Some(SseSelection::C { .. }) => {
                return Err(ApiError::not_implemented().bucket(bucket).object(&object));
            }
        };
        return fan_out_upload(
            state, bucket, headers, layer, form, metadata, fanout_sse, body_stream, audit,
        )
        .await;
    }

    // Single put: hash, then (optionally) encrypt, then hash the
    // ciphertext with unknown size and no declared digests.
    let limited = HardLimitReader::new(body_stream, MAX_POST_SIZE);
    let mut hasher = HashReader::new(limited, -1, "", "")
        .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
    if let Some(checksum) = checksum.clone() {
        hasher
            .add_checksum(checksum)
            .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;
    }
    if let Some((min, max)) = length_range {
        hasher.set_expected_min(min);
        hasher.set_expected_max(max);
    }

    let mut opts = ObjectOptions {
        versioned: state.services.versioning.enabled(bucket),
        version_suspended: state.services.versioning.suspended(bucket),
        user_defined: metadata.clone(),
        ..Default::default()
    };

    let object_info = match sse {
        Some(SseSelection::C { key }) => {
            // Customer-supplied key: the ciphertext is stored, the key is
            // not; only the algorithm marker lands in metadata.
            opts.user_defined.insert(
                META_SSE_ALGORITHM.to_string(),
                skerry_io::SSE_ALGORITHM_C.to_string(),
            );
            let encrypted = EncryptReader::new(hasher, &key);
            let mut ciphertext_hasher = HashReader::new(encrypted, -1, "", "")
                .map_err(|e| ApiError::internal_error().because(e))?;
            layer
                .put_object(bucket, &object, &mut ciphertext_hasher, &opts)
                .await
        }
        Some(selection) => {
            let (kind, key_id, context) = match selection {
                SseSelection::Kms { key_id, context } => (SseKind::Kms, key_id, context),
                _ => (SseKind::S3, String::new(), KmsContext::new()),
            };
            let kms = state.services.kms.as_ref().expect("kms checked above");
            let data_key = kms
                .generate_key(&key_id, &context)
                .await
                .map_err(|e| ApiError::kms_not_configured().because(e).bucket(bucket))?;
            skerry_io::seal_metadata(&mut opts.user_defined, kind, &data_key, &context);

            let encrypted = EncryptReader::new(hasher, &data_key.plaintext);
            let mut ciphertext_hasher = HashReader::new(encrypted, -1, "", "")
                .map_err(|e| ApiError::internal_error().because(e))?;
            layer
                .put_object(bucket, &object, &mut ciphertext_hasher, &opts)
                .await
        }
        None => layer.put_object(bucket, &object, &mut hasher, &opts).await,
    }
    .map_err(|e| to_api_error(e, bucket, &object))?;

    info!(bucket = %bucket, object = %object, etag = %object_info.etag, "post upload complete");

    let location = format!("/{bucket}/{object}");
    let source = audit.source(headers);
    state.services.events.emit(ObjectCreatedPost {
        bucket: bucket.to_string(),
        object: object.clone(),
        version_id: object_info.version_id.clone(),
        etag: object_info.etag.clone(),
        size: object_info.size,
        source: source.clone(),
    });
    if object_info.num_versions > EXCESSIVE_VERSIONS_THRESHOLD {
        state.services.events.emit(ObjectManyVersions {
            bucket: bucket.to_string(),
            object: object.clone(),
            num_versions: object_info.num_versions,
            source,
        });
    }

    if let Some(redirect) = success_redirect {
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("bucket", bucket)
            .append_pair("key", &object)
            .append_pair("etag", &format!("\"{}\"", object_info.etag))
            .finish();
        let sep = if redirect.contains('?') { '&' } else { '?' };
        return Ok(Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(header::LOCATION, format!("{redirect}{sep}{query}"))
            .body(Body::empty())
            .expect("response construction cannot fail"));
    }

    let mut builder = Response::builder()
        .header("ETag", format!("\"{}\"", object_info.etag))
        .header(header::LOCATION, &location);
    if !object_info.version_id.is_empty() {
        builder = builder.header("x-amz-version-id", &object_info.version_id);
    }

    let response = match success_status.as_str() {
        "201" => builder
            .status(StatusCode::CREATED)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(Body::from(crate::xml::post_response(
                bucket,
                &object,
                &object_info.etag,
                &location,
            ))),
        "200" => builder.status(StatusCode::OK).body(Body::empty()),
        _ => builder.status(StatusCode::NO_CONTENT).body(Body::empty()),
    };
    Ok(response.expect("response construction cannot fail"))
}

/// Drive a fan-out upload and stream the NDJSON response.
#[allow(clippy::too_many_arguments)]
async fn fan_out_upload(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    layer: std::sync::Arc<dyn ObjectLayer>,
    form: PostForm,
    mut metadata: BTreeMap<String, String>,
    sse: Option<(SseKind, String, KmsContext)>,
    body_stream: impl tokio::io::AsyncRead + Unpin + Send,
    audit: AuditScope,
) -> Result<Response<Body>, ApiError> {
    // The whole input must fit in memory; reject oversize before any
    // destination is written.
    let mut limited = HardLimitReader::new(body_stream, MAX_FANOUT_SIZE);
    let mut buffer = Vec::new();
    limited
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| ApiError::malformed_post_request().because(e).bucket(bucket))?;

    // One envelope for every destination: encrypt the buffer once and
    // fan the ciphertext out.
    let data = match &sse {
        Some((kind, key_id, context)) => {
            let kms = state.services.kms.as_ref().expect("kms checked by caller");
            let data_key = kms
                .generate_key(key_id, context)
                .await
                .map_err(|e| ApiError::kms_not_configured().because(e).bucket(bucket))?;
            skerry_io::seal_metadata(&mut metadata, *kind, &data_key, context);

            let mut encrypted = EncryptReader::new(buffer.as_slice(), &data_key.plaintext);
            let mut ciphertext = Vec::new();
            encrypted
                .read_to_end(&mut ciphertext)
                .await
                .map_err(|e| ApiError::internal_error().because(e))?;
            Bytes::from(ciphertext)
        }
        None => Bytes::from(buffer),
    };

    let entries = form.fanout;
    let bucket = bucket.to_string();
    let source = audit.source(headers);
    let services = state.services.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    // The driver runs detached so in-flight writes complete even if the
    // client goes away; a dropped receiver stops dispatch between
    // batches.
    tokio::spawn(async move {
        let width = fanout::fanout_concurrency();
        for batch in entries.chunks(width) {
            let results =
                fanout::put_batch(layer.clone(), &bucket, batch, data.clone(), &metadata).await;

            for (key, result) in results {
                let line = match &result {
                    Ok(info) => FanOutResponse {
                        key: key.clone(),
                        etag: info.etag.clone(),
                        version_id: info.version_id.clone(),
                        last_modified: info
                            .mod_time
                            .map(fanout::rfc3339)
                            .unwrap_or_default(),
                        ..Default::default()
                    },
                    Err(e) => FanOutResponse {
                        key: key.clone(),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                };
                let mut line = serde_json::to_vec(&line).expect("response line serializes");
                line.push(b'\n');
                if tx.send(Ok(Bytes::from(line))).await.is_err() {
                    // Client gone: stop dispatching further batches.
                    return;
                }

                if let Ok(info) = result {
                    services.events.emit(ObjectCreatedPost {
                        bucket: bucket.clone(),
                        object: key.clone(),
                        version_id: info.version_id.clone(),
                        etag: info.etag.clone(),
                        size: info.size,
                        source: source.clone(),
                    });
                    if info.num_versions > EXCESSIVE_VERSIONS_THRESHOLD {
                        services.events.emit(ObjectManyVersions {
                            bucket: bucket.clone(),
                            object: key,
                            num_versions: info.num_versions,
                            source: source.clone(),
                        });
                    }
                }
            }
        }
    });

    let stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .expect("response construction cannot fail"))
}

/// Server-side encryption requested by the form.
enum SseSelection {
    /// Internally managed keys.
    S3,
    /// KMS-managed KEK with optional key ID and context.
    Kms {
        key_id: String,
        context: KmsContext,
    },
    /// Client-supplied 256-bit key.
    C { key: Vec<u8> },
}

/// Pull the SSE selection out of the form fields.
fn sse_from_form(form: &PostForm) -> Result<Option<SseSelection>, ApiError> {
    if form
        .get("x-amz-server-side-encryption-customer-algorithm")
        .is_some()
    {
        let key = form
            .get("x-amz-server-side-encryption-customer-key")
            .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64))
            .transpose()
            .map_err(|e| ApiError::invalid_argument().because(e))?
            .unwrap_or_default();
        if key.len() != 32 {
            return Err(ApiError::invalid_argument()
                .because("SSE-C keys must be 256 bits"));
        }
        return Ok(Some(SseSelection::C { key }));
    }
    match form.get("x-amz-server-side-encryption") {
        Some("AES256") => Ok(Some(SseSelection::S3)),
        Some("aws:kms") => {
            let key_id = form
                .get("x-amz-server-side-encryption-aws-kms-key-id")
                .unwrap_or("")
                .to_string();
            let context = match form.get("x-amz-server-side-encryption-context") {
                None => KmsContext::new(),
                Some(b64) => {
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| ApiError::invalid_argument().because(e))?;
                    serde_json::from_slice(&raw)
                        .map_err(|e| ApiError::invalid_argument().because(e))?
                }
            };
            Ok(Some(SseSelection::Kms { key_id, context }))
        }
        Some(other) => Err(ApiError::invalid_argument()
            .because(format!("unknown server side encryption {other}"))),
        None => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Policy document
// -----------------------------------------------------------------------

/// A parsed POST policy document.
pub(crate) struct PostPolicy {
    expiration: Option<DateTime<Utc>>,
    /// `(field, value, starts_with)` equality/prefix conditions.
    conditions: Vec<(String, String, bool)>,
    /// `content-length-range` low/high bounds, applied to the plaintext
    /// byte count.
    pub(crate) content_length_range: Option<(i64, i64)>,
}

impl PostPolicy {
    /// Parse the base64-decoded policy JSON.
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, String> {
        #[derive(serde::Deserialize)]
        struct Doc {
            #[serde(default)]
            expiration: Option<String>,
            #[serde(default)]
            conditions: Vec<serde_json::Value>,
        }
        let doc: Doc = serde_json::from_slice(raw).map_err(|e| e.to_string())?;

        let expiration = match doc.expiration {
            None => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| format!("invalid expiration: {e}"))?
                    .with_timezone(&Utc),
            ),
        };

        let mut conditions = Vec::new();
        let mut content_length_range = None;
        for cond in doc.conditions {
            match cond {
                // {"bucket": "name"} form: exact match.
                serde_json::Value::Object(map) => {
                    for (field, value) in map {
                        let value = value.as_str().unwrap_or_default().to_string();
                        conditions.push((field.to_ascii_lowercase(), value, false));
                    }
                }
                // ["eq"|"starts-with", "$field", "value"] or
                // ["content-length-range", min, max].
                serde_json::Value::Array(items) => {
                    let op = items
                        .first()
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_ascii_lowercase();
                    match op.as_str() {
                        "eq" | "starts-with" => {
                            let field = items
                                .get(1)
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .trim_start_matches('$')
                                .to_ascii_lowercase();
                            let value = items
                                .get(2)
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            conditions.push((field, value, op == "starts-with"));
                        }
                        "content-length-range" => {
                            let min = items.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
                            let max = items.get(2).and_then(|v| v.as_i64()).unwrap_or(i64::MAX);
                            content_length_range = Some((min, max));
                        }
                        other => return Err(format!("unknown policy condition {other}")),
                    }
                }
                _ => return Err("malformed policy condition".to_string()),
            }
        }

        Ok(Self {
            expiration,
            conditions,
            content_length_range,
        })
    }

    /// Verify the form values satisfy every policy condition.
    pub(crate) fn check(&self, form: &PostForm, bucket: &str) -> Result<(), String> {
        if let Some(expiration) = self.expiration {
            if Utc::now() > expiration {
                return Err("policy expired".to_string());
            }
        }
        for (field, expected, starts_with) in &self.conditions {
            let actual = if field == "bucket" {
                bucket
            } else {
                form.get(field).unwrap_or("")
            };
            let ok = if *starts_with {
                actual.starts_with(expected.as_str())
            } else {
                actual == expected
            };
            if !ok {
                return Err(format!("policy condition failed on {field}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn form_with(values: &[(&str, &str)]) -> PostForm {
        PostForm {
            values: values
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            fanout: Vec::new(),
        }
    }

    #[test]
    fn policy_eq_and_starts_with() {
        let policy = PostPolicy::parse(
            br#"{"expiration": "2099-01-01T00:00:00Z", "conditions": [
                {"bucket": "photos"},
                ["eq", "$acl", "public-read"],
                ["starts-with", "$key", "uploads/"],
                ["content-length-range", 1, 1024]
            ]}"#,
        )
        .unwrap();

        let form = form_with(&[("acl", "public-read"), ("key", "uploads/cat.jpg")]);
        policy.check(&form, "photos").unwrap();
        assert_eq!(policy.content_length_range, Some((1, 1024)));

        let form = form_with(&[("acl", "private"), ("key", "uploads/cat.jpg")]);
        assert!(policy.check(&form, "photos").is_err());

        let form = form_with(&[("acl", "public-read"), ("key", "elsewhere/cat.jpg")]);
        assert!(policy.check(&form, "photos").is_err());
    }

    #[test]
    fn expired_policy_is_rejected() {
        let policy =
            PostPolicy::parse(br#"{"expiration": "2000-01-01T00:00:00Z", "conditions": []}"#)
                .unwrap();
        assert!(policy.check(&form_with(&[]), "b").is_err());
    }

    #[test]
    fn unknown_condition_is_an_error() {
        assert!(PostPolicy::parse(br#"{"conditions": [["matches", "$key", ".*"]]}"#).is_err());
    }
}
