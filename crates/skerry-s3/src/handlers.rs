//! Bucket-level S3 request handlers.
//!
//! Query parameters decide which operation a method maps to, the same way
//! the AWS API multiplexes sub-resources: `GET /{bucket}?location` is
//! GetBucketLocation while `GET /{bucket}?uploads` is
//! ListMultipartUploads.

use std::collections::{BTreeMap, HashMap};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, Response, StatusCode};
use bytes::Bytes;
use skerry_object::services::{
    action, AuthArgs, BucketMetadataSys, Credential, DnsStore, PolicyEngine,
    ReplicationScheduler, VersioningSys,
};
use skerry_object::{
    BucketOptions, DeleteBucketOptions, MakeBucketOptions, ObjectOptions, MAX_BUCKETS,
};
use skerry_types::events::{
    BucketCreated, BucketRemoved, EventSource, ObjectRemovedDelete,
    ObjectRemovedDeleteMarkerCreated,
};
use skerry_types::{ObjectToDelete, VersionPurgeStatus, NULL_VERSION_ID};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{to_api_error, ApiError};
use crate::{post_policy, xml, AppState, MAX_DELETE_BODY, MAX_DELETE_LIST};

/// Header opting a new bucket into object lock.
const AMZ_OBJECT_LOCK_ENABLED: &str = "x-amz-bucket-object-lock-enabled";
/// Header bypassing the federation existence check on creation.
const FORCE_CREATE_HEADER: &str = "x-skerry-force-create";
/// Header forcing deletion of a non-empty bucket.
const FORCE_DELETE_HEADER: &str = "x-skerry-force-delete";

/// Deferred audit record: logged when the handler scope unwinds, whatever
/// the outcome.
pub(crate) struct AuditScope {
    operation: &'static str,
    bucket: String,
    request_id: String,
}

impl AuditScope {
    pub(crate) fn new(operation: &'static str, bucket: &str) -> Self {
        Self {
            operation,
            bucket: bucket.to_string(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Event provenance for this request.
    pub(crate) fn source(&self, headers: &HeaderMap) -> EventSource {
        EventSource {
            host: header_str(headers, "host").unwrap_or_default().to_string(),
            user_agent: header_str(headers, "user-agent")
                .unwrap_or_default()
                .to_string(),
            request_id: self.request_id.clone(),
        }
    }
}

impl Drop for AuditScope {
    fn drop(&mut self) {
        info!(
            target: "skerry::audit",
            operation = self.operation,
            bucket = %self.bucket,
            request_id = %self.request_id,
            "request complete"
        );
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify the request credential.
pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Credential, bool), ApiError> {
    state
        .services
        .iam
        .authenticate(header_str(headers, header::AUTHORIZATION.as_str()))
        .map_err(ApiError::from)
}

/// Authenticate, then authorize one action. The common gate for
/// single-resource handlers.
pub(crate) fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
    act: &str,
    bucket: &str,
    object: &str,
) -> Result<(Credential, bool), ApiError> {
    let (cred, is_owner) = authenticate(state, headers)?;
    let allowed = state.services.iam.is_allowed(&AuthArgs {
        action: act,
        bucket,
        object,
        credential: &cred,
        conditions: BTreeMap::new(),
        is_owner,
    });
    if !allowed {
        return Err(ApiError::access_denied().bucket(bucket).object(object));
    }
    Ok((cred, is_owner))
}

fn parse_bool_header(headers: &HeaderMap, name: &str) -> Result<Option<bool>, ApiError> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(ApiError::invalid_request().because(format!("invalid {name}: {v}"))),
        },
    }
}

fn xml_response(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body))
        .expect("response construction cannot fail")
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("response construction cannot fail")
}

// -----------------------------------------------------------------------
// GET / — ListBuckets
// -----------------------------------------------------------------------

/// List all buckets the caller may see. On a federated deployment the
/// DNS directory is the source of truth; otherwise the object layer is.
pub(crate) async fn list_buckets_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("ListBuckets", "");
    let layer = state.layer()?;

    let (cred, is_owner) = authenticate(&state, &headers)?;
    // Anonymous identities are rejected outright for list-all-buckets.
    if cred.is_anonymous() {
        return Err(ApiError::access_denied());
    }
    let list_all_allowed = state.services.iam.is_allowed(&AuthArgs {
        action: action::LIST_ALL_MY_BUCKETS,
        bucket: "",
        object: "",
        credential: &cred,
        conditions: BTreeMap::new(),
        is_owner,
    });

    let mut buckets = match &state.services.dns {
        Some(dns) => match dns.list().await {
            Ok(records) => {
                let mut out: Vec<skerry_object::BucketInfo> = records
                    .into_iter()
                    .filter_map(|(name, records)| {
                        records.first().map(|r| skerry_object::BucketInfo {
                            name,
                            created: r.created,
                            object_lock_enabled: false,
                        })
                    })
                    .collect();
                out.sort_by(|a, b| a.name.cmp(&b.name));
                out
            }
            Err(e) if e.is_ignorable() => Vec::new(),
            Err(e) => {
                return Err(ApiError::internal_error().because(e));
            }
        },
        None => layer
            .list_buckets(BucketOptions::default())
            .await
            .map_err(|e| to_api_error(e, "", ""))?,
    };

    if !list_all_allowed {
        // Keep the buckets the caller can list or locate; deny only when
        // nothing remains.
        buckets.retain(|b| {
            [action::LIST_BUCKET, action::GET_BUCKET_LOCATION]
                .iter()
                .any(|&act| {
                    state.services.iam.is_allowed(&AuthArgs {
                        action: act,
                        bucket: &b.name,
                        object: "",
                        credential: &cred,
                        conditions: BTreeMap::new(),
                        is_owner,
                    })
                })
        });
        if buckets.is_empty() {
            return Err(ApiError::access_denied());
        }
    }

    Ok(xml_response(xml::list_all_my_buckets(
        &cred.access_key,
        &buckets,
    )))
}

// -----------------------------------------------------------------------
// GET/HEAD /{bucket} dispatch
// -----------------------------------------------------------------------

/// Dispatch GET on a bucket between its sub-resources, and serve HEAD.
pub(crate) async fn bucket_get_dispatch(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    if method == Method::HEAD {
        return Ok(head_bucket(&state, &bucket, &headers).await);
    }
    if params.contains_key("location") {
        return get_bucket_location(&state, &bucket, &headers).await;
    }
    if params.contains_key("uploads") {
        return list_multipart_uploads(&state, &bucket, &params, &headers).await;
    }
    if params.contains_key("policyStatus") {
        return get_bucket_policy_status(&state, &bucket, &headers).await;
    }
    if params.contains_key("object-lock") {
        return get_object_lock_config(&state, &bucket, &headers).await;
    }
    if params.contains_key("tagging") {
        return get_bucket_tagging(&state, &bucket, &headers).await;
    }
    Err(ApiError::not_implemented().bucket(&bucket))
}

async fn get_bucket_location(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("GetBucketLocation", bucket);
    let layer = state.layer()?;
    check_auth(state, headers, action::GET_BUCKET_LOCATION, bucket, "")?;

    layer
        .get_bucket_info(bucket, BucketOptions::default())
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    Ok(xml_response(xml::location_response(&state.services.region)))
}

async fn list_multipart_uploads(
    state: &AppState,
    bucket: &str,
    params: &BTreeMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("ListMultipartUploads", bucket);
    let layer = state.layer()?;
    check_auth(
        state,
        headers,
        action::LIST_BUCKET_MULTIPART_UPLOADS,
        bucket,
        "",
    )?;

    let prefix = params.get("prefix").map(String::as_str).unwrap_or("");
    let key_marker = params.get("key-marker").map(String::as_str).unwrap_or("");
    let upload_id_marker = params
        .get("upload-id-marker")
        .map(String::as_str)
        .unwrap_or("");
    let delimiter = params.get("delimiter").map(String::as_str).unwrap_or("");
    let max_uploads: i64 = match params.get("max-uploads") {
        None => 1000,
        Some(v) => v
            .parse()
            .map_err(|_| ApiError::invalid_max_uploads().bucket(bucket))?,
    };
    if max_uploads < 0 {
        return Err(ApiError::invalid_max_uploads().bucket(bucket));
    }
    // Marker not sharing the prefix is not implemented.
    if !key_marker.is_empty() && !key_marker.starts_with(prefix) {
        return Err(ApiError::not_implemented().bucket(bucket));
    }

    let info = layer
        .list_multipart_uploads(
            bucket,
            prefix,
            key_marker,
            upload_id_marker,
            delimiter,
            max_uploads as usize,
        )
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    Ok(xml_response(xml::list_multipart_uploads(bucket, &info)))
}

async fn get_bucket_policy_status(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("GetBucketPolicyStatus", bucket);
    let layer = state.layer()?;
    check_auth(state, headers, action::GET_BUCKET_POLICY_STATUS, bucket, "")?;

    layer
        .get_bucket_info(bucket, BucketOptions::default())
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    let anon = Credential::default();
    let anon_may = |act: &str| {
        state.services.iam.is_allowed_anonymous(&AuthArgs {
            action: act,
            bucket,
            object: "",
            credential: &anon,
            conditions: BTreeMap::new(),
            is_owner: false,
        })
    };
    let is_public = anon_may(action::LIST_BUCKET) && anon_may(action::PUT_OBJECT);

    Ok(xml_response(xml::policy_status(is_public)))
}

async fn head_bucket(state: &AppState, bucket: &str, headers: &HeaderMap) -> Response<Body> {
    let _audit = AuditScope::new("HeadBucket", bucket);
    let layer = match state.layer() {
        Ok(layer) => layer,
        Err(e) => return e.into_headers_only(),
    };
    // HEAD errors go out as headers; the response has no body to carry
    // the XML document.
    if let Err(e) = check_auth(state, headers, action::LIST_BUCKET, bucket, "") {
        return e.into_headers_only();
    }
    match layer.get_bucket_info(bucket, BucketOptions::default()).await {
        Ok(_) => empty_response(StatusCode::OK),
        Err(e) => to_api_error(e, bucket, "").into_headers_only(),
    }
}

// -----------------------------------------------------------------------
// PUT /{bucket}
// -----------------------------------------------------------------------

/// Create a bucket, or store one of its sub-resource configurations.
pub(crate) async fn put_bucket_handler(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    if params.contains_key("object-lock") {
        return put_object_lock_config(&state, &bucket, &headers, &body).await;
    }
    if params.contains_key("tagging") {
        return put_bucket_tagging(&state, &bucket, &headers, &body).await;
    }

    let audit = AuditScope::new("PutBucket", &bucket);
    let layer = state.layer()?;

    let lock_enabled = parse_bool_header(&headers, AMZ_OBJECT_LOCK_ENABLED)?.unwrap_or(false);
    let force_create = parse_bool_header(&headers, FORCE_CREATE_HEADER)?.unwrap_or(false);

    let (cred, is_owner) = check_auth(&state, &headers, action::CREATE_BUCKET, &bucket, "")?;

    if lock_enabled {
        // Creating a locked bucket needs the versioning permissions too.
        for act in [
            action::PUT_BUCKET_OBJECT_LOCK_CONFIGURATION,
            action::PUT_BUCKET_VERSIONING,
        ] {
            let allowed = state.services.iam.is_allowed(&AuthArgs {
                action: act,
                bucket: &bucket,
                object: "",
                credential: &cred,
                conditions: BTreeMap::new(),
                is_owner,
            });
            if !allowed {
                return Err(ApiError::access_denied().bucket(&bucket));
            }
        }
    }

    parse_location_constraint(&body)?;

    let count = state.services.bucket_meta.count().await;
    if count + 1 > MAX_BUCKETS {
        warn!(
            buckets = count + 1,
            max = MAX_BUCKETS,
            "bucket creation beyond the recommended maximum"
        );
    }

    let opts = MakeBucketOptions {
        lock_enabled,
        force_create,
    };

    if let Some(dns) = &state.services.dns {
        if !force_create {
            match dns.get(&bucket).await {
                Ok(records) => {
                    // The bucket already exists in the federation; ours iff
                    // its record intersects our IPs.
                    let ours = records.iter().any(|r| {
                        r.hosts
                            .iter()
                            .any(|h| state.services.local_ips.contains(h))
                    });
                    let err = if ours {
                        ApiError::bucket_already_owned_by_you()
                    } else {
                        ApiError::bucket_already_exists()
                    };
                    return Err(err.bucket(&bucket));
                }
                Err(e) if e.is_ignorable() => {}
                Err(e) => return Err(ApiError::internal_error().because(e).bucket(&bucket)),
            }
        }

        layer
            .make_bucket(&bucket, opts)
            .await
            .map_err(|e| to_api_error(e, &bucket, ""))?;

        if let Err(e) = dns.put(&bucket).await {
            // The federation write failed; roll the local bucket back so
            // the directory stays the source of truth.
            if let Err(rollback) = layer
                .delete_bucket(&bucket, DeleteBucketOptions { force: true })
                .await
            {
                warn!(bucket = %bucket, error = %rollback, "rollback after dns failure failed");
            }
            return Err(ApiError::internal_error().because(e).bucket(&bucket));
        }
    } else {
        layer
            .make_bucket(&bucket, opts)
            .await
            .map_err(|e| to_api_error(e, &bucket, ""))?;
    }

    info!(bucket = %bucket, lock_enabled, "bucket created");
    state.services.events.emit(BucketCreated {
        bucket: bucket.clone(),
        source: audit.source(&headers),
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::LOCATION, format!("/{bucket}"))
        .body(Body::empty())
        .expect("response construction cannot fail"))
}

/// Parse (and discard) the optional `CreateBucketConfiguration` body.
fn parse_location_constraint(body: &[u8]) -> Result<(), ApiError> {
    if body.is_empty() {
        return Ok(());
    }
    #[derive(serde::Deserialize)]
    struct CreateBucketConfiguration {
        #[serde(rename = "LocationConstraint", default)]
        _location: String,
    }
    quick_xml::de::from_reader::<_, CreateBucketConfiguration>(body)
        .map(|_| ())
        .map_err(|e| ApiError::malformed_xml().because(e))
}

// -----------------------------------------------------------------------
// DELETE /{bucket}
// -----------------------------------------------------------------------

/// Delete a bucket, or its tagging configuration.
pub(crate) async fn delete_bucket_handler(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    if params.contains_key("tagging") {
        return delete_bucket_tagging(&state, &bucket, &headers).await;
    }

    let audit = AuditScope::new("DeleteBucket", &bucket);
    let layer = state.layer()?;
    check_auth(&state, &headers, action::DELETE_BUCKET, &bucket, "")?;

    let mut force = false;
    if let Some(value) = header_str(&headers, FORCE_DELETE_HEADER) {
        force = value
            .parse::<bool>()
            .map_err(|e| ApiError::invalid_request().with_description(e.to_string()))?;

        // The force policy is evaluated whenever the header is present,
        // whatever its value.
        check_auth(&state, &headers, action::FORCE_DELETE_BUCKET, &bucket, "")?;

        if force {
            if state.services.bucket_meta.object_lock_enabled(&bucket).await {
                return Err(ApiError::method_not_allowed().bucket(&bucket));
            }
            if state.services.bucket_meta.replication_enabled(&bucket).await {
                return Err(ApiError::method_not_allowed().bucket(&bucket));
            }
        }
    }

    if let Err(e) = layer
        .delete_bucket(&bucket, DeleteBucketOptions { force })
        .await
    {
        let mut api = to_api_error(e.clone(), &bucket, "");
        if matches!(e, skerry_object::ObjectError::BucketNotEmpty { .. })
            && (state.services.versioning.enabled(&bucket)
                || state.services.versioning.suspended(&bucket))
        {
            api = api.with_description(
                "The bucket you tried to delete is not empty. You must delete all versions in the bucket.",
            );
        }
        return Err(api);
    }

    if let Some(dns) = &state.services.dns {
        if let Err(e) = dns.delete(&bucket).await {
            warn!(bucket = %bucket, error = %e, "bucket removed locally but the DNS entry remains; delete it manually");
            return Err(ApiError::internal_error().because(e).bucket(&bucket));
        }
    }

    info!(bucket = %bucket, force, "bucket deleted");
    state.services.events.emit(BucketRemoved {
        bucket: bucket.clone(),
        source: audit.source(&headers),
    });

    Ok(empty_response(StatusCode::NO_CONTENT))
}

// -----------------------------------------------------------------------
// POST /{bucket} dispatch
// -----------------------------------------------------------------------

/// Dispatch POST on a bucket: bulk delete, or a browser policy upload.
pub(crate) async fn bucket_post_dispatch(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ApiError> {
    if params.contains_key("delete") {
        let body = axum::body::to_bytes(body, MAX_DELETE_BODY as usize)
            .await
            .map_err(|_| ApiError::entity_too_large().bucket(&bucket))?;
        return delete_multiple_objects(&state, &bucket, &headers, body).await;
    }
    post_policy::post_policy_handler(&state, &bucket, &headers, body).await
}

// -----------------------------------------------------------------------
// POST /{bucket}?delete — DeleteMultipleObjects
// -----------------------------------------------------------------------

#[derive(Default)]
struct DeleteSlot {
    deleted: Option<(xml::DeletedEntry, skerry_types::DeletedObject)>,
    error: Option<xml::DeleteErrorEntry>,
}

/// Bulk delete. Responses preserve request order and dedupe repeated
/// `(key, version)` pairs; missing objects count as deleted.
pub(crate) async fn delete_multiple_objects(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    let audit = AuditScope::new("DeleteMultipleObjects", bucket);
    let layer = state.layer()?;

    // Content-MD5 and Content-Length are hard preconditions of the S3
    // multi-delete protocol.
    if !headers.contains_key("content-md5") {
        return Err(ApiError::missing_content_md5().bucket(bucket));
    }
    let content_length: i64 = header_str(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1);
    if content_length <= 0 {
        return Err(ApiError::missing_content_length().bucket(bucket));
    }
    if content_length as u64 > MAX_DELETE_BODY {
        return Err(ApiError::entity_too_large().bucket(bucket));
    }

    let request = xml::parse_delete_request(&body)
        .map_err(|e| ApiError::malformed_xml().because(e).bucket(bucket))?;
    if request.objects.is_empty() || request.objects.len() > MAX_DELETE_LIST {
        return Err(ApiError::malformed_xml().bucket(bucket));
    }

    // A signature or credential failure aborts the whole request;
    // per-object denials become per-entry errors below.
    let (cred, is_owner) = authenticate(state, headers)?;

    layer
        .get_bucket_info(bucket, BucketOptions::default())
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    let replicate_deletes = state.services.bucket_meta.replication_enabled(bucket).await;
    let lock_enabled = state.services.bucket_meta.object_lock_enabled(bucket).await;
    let versioning = &state.services.versioning;

    let mut slots: Vec<DeleteSlot> = request.objects.iter().map(|_| DeleteSlot::default()).collect();
    // Dedupe on (name, version); the map value is the entry's original
    // index so results scatter back into request order.
    let mut index_of: HashMap<(String, String), usize> = HashMap::new();
    let mut delete_list: Vec<ObjectToDelete> = Vec::new();
    let mut swept: Vec<String> = Vec::new();

    for (index, entry) in request.objects.iter().enumerate() {
        let name = entry.key.trim_start_matches('/').to_string();
        let mut version_id = entry.version_id.clone();

        let allowed = state.services.iam.is_allowed(&AuthArgs {
            action: action::DELETE_OBJECT,
            bucket,
            object: &name,
            credential: &cred,
            conditions: BTreeMap::new(),
            is_owner,
        });
        if !allowed {
            let api = ApiError::access_denied();
            slots[index].error = Some(xml::DeleteErrorEntry {
                key: name,
                version_id,
                code: api.code.to_string(),
                message: api.description,
            });
            continue;
        }

        if !version_id.is_empty() && version_id != NULL_VERSION_ID {
            if let Err(e) = Uuid::parse_str(&version_id) {
                let api = ApiError::no_such_version();
                slots[index].error = Some(xml::DeleteErrorEntry {
                    key: name,
                    version_id,
                    code: api.code.to_string(),
                    message: format!("{} ({e})", api.description),
                });
                continue;
            }
        }

        let opts = ObjectOptions {
            version_id: version_id.clone(),
            versioned: versioning.prefix_enabled(bucket, &name),
            version_suspended: versioning.suspended(bucket),
            ..Default::default()
        };

        // Metadata fetch feeds both the retention check and the
        // transitioned-tier sweep.
        let mut info = None;
        if replicate_deletes || (!version_id.is_empty() && lock_enabled) {
            info = layer.get_object_info(bucket, &name, &opts).await.ok();
        }
        if let Some(info) = &info {
            if !info.transitioned_object.is_empty() {
                swept.push(name.clone());
            }
        }

        if !version_id.is_empty() && lock_enabled {
            let bypass = state.services.iam.is_allowed(&AuthArgs {
                action: action::BYPASS_GOVERNANCE_RETENTION,
                bucket,
                object: &name,
                credential: &cred,
                conditions: BTreeMap::new(),
                is_owner,
            });
            if !bypass {
                let api = ApiError::access_denied();
                slots[index].error = Some(xml::DeleteErrorEntry {
                    key: name,
                    version_id,
                    code: api.code.to_string(),
                    message: api.description,
                });
                continue;
            }
        }

        // Deletes on directory objects always target the null version.
        if name.ends_with('/') && version_id.is_empty() {
            version_id = NULL_VERSION_ID.to_string();
        }

        let mut object = ObjectToDelete {
            name,
            version_id,
            ..Default::default()
        };
        if replicate_deletes {
            object.purge_status = VersionPurgeStatus::Pending;
            object.replicate_decision = "replicate".to_string();
        }

        let key = (object.name.clone(), object.version_id.clone());
        index_of.entry(key).or_insert_with(|| {
            delete_list.push(object);
            index
        });
    }

    // The bulk call runs on a spawned task: a client disconnect must not
    // leave the deletes half-applied.
    let results = {
        let layer = layer.clone();
        let bucket = bucket.to_string();
        let delete_list = delete_list.clone();
        let opts = ObjectOptions {
            version_suspended: versioning.suspended(&bucket),
            ..Default::default()
        };
        tokio::spawn(async move { layer.delete_objects(&bucket, delete_list, &opts).await })
            .await
            .map_err(|e| ApiError::internal_error().because(e))?
    };

    for (i, (deleted, err)) in results.into_iter().enumerate() {
        let requested = &delete_list[i];
        let key = (requested.name.clone(), requested.version_id.clone());
        let Some(&index) = index_of.get(&key) else {
            continue;
        };
        match err {
            // Idempotent delete: already-gone objects count as deleted.
            None => {}
            Some(e) if e.is_not_found() => {}
            Some(e) => {
                let api = to_api_error(e, bucket, &requested.name);
                slots[index].error = Some(xml::DeleteErrorEntry {
                    key: requested.name.clone(),
                    version_id: requested.version_id.clone(),
                    code: api.code.to_string(),
                    message: api.description,
                });
                continue;
            }
        }
        let mut deleted = deleted;
        if deleted.name.is_empty() {
            deleted.name = requested.name.clone();
            deleted.version_id = requested.version_id.clone();
        }
        if replicate_deletes {
            deleted.purge_status = requested.purge_status;
        }
        slots[index].deleted = Some((
            xml::DeletedEntry {
                key: deleted.name.clone(),
                version_id: deleted.version_id.clone(),
                delete_marker: deleted.delete_marker,
                delete_marker_version_id: deleted.delete_marker_version_id.clone(),
            },
            deleted,
        ));
    }

    let mut deleted_entries = Vec::new();
    let mut deleted_objects = Vec::new();
    let mut error_entries = Vec::new();
    for slot in slots {
        if let Some(err) = slot.error {
            error_entries.push(err);
        } else if let Some((entry, object)) = slot.deleted {
            deleted_entries.push(entry);
            deleted_objects.push(object);
        }
    }

    let response = xml_response(xml::delete_result(
        request.quiet,
        deleted_entries,
        error_entries,
    ));

    // Events and replication scheduling happen after the response is
    // assembled, mirroring the write-then-notify ordering of the API.
    let source = audit.source(headers);
    for deleted in &deleted_objects {
        if deleted.name.is_empty() {
            continue;
        }
        if replicate_deletes && deleted.purge_status == VersionPurgeStatus::Pending {
            state.services.replication.schedule_delete(bucket, deleted);
        }
        if deleted.delete_marker {
            state.services.events.emit(ObjectRemovedDeleteMarkerCreated {
                bucket: bucket.to_string(),
                object: deleted.name.clone(),
                version_id: deleted.delete_marker_version_id.clone(),
                source: source.clone(),
            });
        } else {
            state.services.events.emit(ObjectRemovedDelete {
                bucket: bucket.to_string(),
                object: deleted.name.clone(),
                version_id: deleted.version_id.clone(),
                source: source.clone(),
            });
        }
    }
    for name in swept {
        // Tier remnants are swept by the transition subsystem; the core
        // only reports what it deleted.
        tracing::debug!(bucket = %bucket, object = %name, "transitioned object removed, tier sweep queued");
    }

    Ok(response)
}

// -----------------------------------------------------------------------
// Object lock configuration
// -----------------------------------------------------------------------

async fn put_object_lock_config(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("PutBucketObjectLockConfig", bucket);
    state.layer()?;
    check_auth(
        state,
        headers,
        action::PUT_BUCKET_OBJECT_LOCK_CONFIGURATION,
        bucket,
        "",
    )?;

    let config = xml::parse_object_lock_config(body)
        .map_err(|e| ApiError::malformed_xml().with_description(e.to_string()).bucket(bucket))?;

    // Lock configuration is only writable on buckets created with lock
    // enabled.
    if !state.services.bucket_meta.object_lock_enabled(bucket).await {
        return Err(ApiError::invalid_request()
            .with_description("Bucket is missing ObjectLockConfiguration")
            .bucket(bucket));
    }

    let data = xml::object_lock_config_xml(&config).into_bytes();
    state
        .services
        .bucket_meta
        .set_config(bucket, skerry_object::services::OBJECT_LOCK_CONFIG, data)
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    Ok(empty_response(StatusCode::OK))
}

async fn get_object_lock_config(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("GetBucketObjectLockConfig", bucket);
    state.layer()?;
    check_auth(
        state,
        headers,
        action::GET_BUCKET_OBJECT_LOCK_CONFIGURATION,
        bucket,
        "",
    )?;

    let data = state
        .services
        .bucket_meta
        .get_config(bucket, skerry_object::services::OBJECT_LOCK_CONFIG)
        .await
        .map_err(|_| ApiError::object_lock_config_not_found().bucket(bucket))?;

    Ok(xml_response(String::from_utf8_lossy(&data).into_owned()))
}

// -----------------------------------------------------------------------
// Bucket tagging
// -----------------------------------------------------------------------

async fn put_bucket_tagging(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("PutBucketTagging", bucket);
    let layer = state.layer()?;

    layer
        .get_bucket_info(bucket, BucketOptions::default())
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;
    check_auth(state, headers, action::PUT_BUCKET_TAGGING, bucket, "")?;

    let tagging = xml::parse_tagging(body)
        .map_err(|e| ApiError::malformed_xml().with_description(e.to_string()).bucket(bucket))?;

    let data = xml::tagging_xml(&tagging).into_bytes();
    state
        .services
        .bucket_meta
        .set_config(bucket, skerry_object::services::BUCKET_TAGGING_CONFIG, data)
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    Ok(empty_response(StatusCode::OK))
}

async fn get_bucket_tagging(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("GetBucketTagging", bucket);
    state.layer()?;
    check_auth(state, headers, action::GET_BUCKET_TAGGING, bucket, "")?;

    let data = state
        .services
        .bucket_meta
        .get_config(bucket, skerry_object::services::BUCKET_TAGGING_CONFIG)
        .await
        .map_err(|_| ApiError::no_such_tag_set().bucket(bucket))?;

    Ok(xml_response(String::from_utf8_lossy(&data).into_owned()))
}

async fn delete_bucket_tagging(
    state: &AppState,
    bucket: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let _audit = AuditScope::new("DeleteBucketTagging", bucket);
    state.layer()?;
    check_auth(state, headers, action::PUT_BUCKET_TAGGING, bucket, "")?;

    state
        .services
        .bucket_meta
        .delete_config(bucket, skerry_object::services::BUCKET_TAGGING_CONFIG)
        .await
        .map_err(|e| to_api_error(e, bucket, ""))?;

    Ok(empty_response(StatusCode::NO_CONTENT))
}
