//! XML request/response types for the S3 surface, via `quick-xml` + serde.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use skerry_object::{BucketInfo, ListMultipartsInfo};

use crate::error::ApiError;

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

fn iso8601(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// -----------------------------------------------------------------------
// Error document
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "Error")]
struct ErrorXml<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Message")]
    message: &'a str,
    #[serde(rename = "BucketName", skip_serializing_if = "str::is_empty")]
    bucket_name: &'a str,
    #[serde(rename = "Key", skip_serializing_if = "str::is_empty")]
    key: &'a str,
    #[serde(rename = "Resource")]
    resource: String,
    #[serde(rename = "RequestId")]
    request_id: String,
}

pub(crate) fn error_xml(err: &ApiError) -> String {
    let resource = if err.object.is_empty() {
        format!("/{}", err.bucket)
    } else {
        format!("/{}/{}", err.bucket, err.object)
    };
    quick_xml::se::to_string(&ErrorXml {
        code: err.code,
        message: &err.description,
        bucket_name: &err.bucket,
        key: &err.object,
        resource,
        request_id: uuid::Uuid::new_v4().to_string(),
    })
    .expect("error xml contains only safe strings")
}

// -----------------------------------------------------------------------
// LocationResponse (GET /{bucket}?location)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "LocationConstraint")]
struct LocationResponse<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "$text", skip_serializing_if = "str::is_empty")]
    location: &'a str,
}

pub(crate) fn location_response(region: &str) -> String {
    quick_xml::se::to_string(&LocationResponse {
        xmlns: S3_XMLNS,
        location: region,
    })
    .expect("location xml contains only safe strings")
}

// -----------------------------------------------------------------------
// ListAllMyBucketsResult (GET /)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "ListAllMyBucketsResult")]
struct ListAllMyBucketsResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Owner")]
    owner: Owner,
    #[serde(rename = "Buckets")]
    buckets: Buckets,
}

#[derive(Serialize)]
struct Owner {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Serialize)]
struct Buckets {
    #[serde(rename = "Bucket")]
    bucket: Vec<BucketEntry>,
}

#[derive(Serialize)]
struct BucketEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CreationDate")]
    creation_date: String,
}

pub(crate) fn list_all_my_buckets(owner_id: &str, buckets: &[BucketInfo]) -> String {
    quick_xml::se::to_string(&ListAllMyBucketsResult {
        xmlns: S3_XMLNS,
        owner: Owner {
            id: owner_id.to_string(),
        },
        buckets: Buckets {
            bucket: buckets
                .iter()
                .map(|b| BucketEntry {
                    name: b.name.clone(),
                    creation_date: iso8601(b.created),
                })
                .collect(),
        },
    })
    .expect("bucket list xml contains only safe strings")
}

// -----------------------------------------------------------------------
// Multi-delete request/response (POST /{bucket}?delete)
// -----------------------------------------------------------------------

/// Parsed `<Delete>` request body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "Delete")]
pub(crate) struct DeleteRequest {
    #[serde(rename = "Quiet", default)]
    pub quiet: bool,
    #[serde(rename = "Object", default)]
    pub objects: Vec<DeleteObjectEntry>,
}

/// One `<Object>` of a multi-delete request.
#[derive(Debug, Default, Clone, Deserialize)]
pub(crate) struct DeleteObjectEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId", default)]
    pub version_id: String,
}

pub(crate) fn parse_delete_request(body: &[u8]) -> Result<DeleteRequest, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

/// One `<Deleted>` entry of the response.
#[derive(Debug, Default, Serialize)]
pub(crate) struct DeletedEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId", skip_serializing_if = "String::is_empty")]
    pub version_id: String,
    #[serde(rename = "DeleteMarker", skip_serializing_if = "std::ops::Not::not")]
    pub delete_marker: bool,
    #[serde(
        rename = "DeleteMarkerVersionId",
        skip_serializing_if = "String::is_empty"
    )]
    pub delete_marker_version_id: String,
}

/// One `<Error>` entry of the response.
#[derive(Debug, Default, Serialize)]
pub(crate) struct DeleteErrorEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId", skip_serializing_if = "String::is_empty")]
    pub version_id: String,
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename = "DeleteResult")]
struct DeleteResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Deleted")]
    deleted: Vec<DeletedEntry>,
    #[serde(rename = "Error")]
    errors: Vec<DeleteErrorEntry>,
}

pub(crate) fn delete_result(
    quiet: bool,
    deleted: Vec<DeletedEntry>,
    errors: Vec<DeleteErrorEntry>,
) -> String {
    quick_xml::se::to_string(&DeleteResult {
        xmlns: S3_XMLNS,
        // Quiet mode suppresses successful entries, errors always show.
        deleted: if quiet { Vec::new() } else { deleted },
        errors,
    })
    .expect("delete result xml contains only safe strings")
}

// -----------------------------------------------------------------------
// PolicyStatus (GET /{bucket}?policyStatus)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "PolicyStatus")]
struct PolicyStatus {
    // Uppercase strings, not booleans; clients parse these verbatim.
    #[serde(rename = "IsPublic")]
    is_public: &'static str,
}

pub(crate) fn policy_status(is_public: bool) -> String {
    quick_xml::se::to_string(&PolicyStatus {
        is_public: if is_public { "TRUE" } else { "FALSE" },
    })
    .expect("policy status xml contains only safe strings")
}

// -----------------------------------------------------------------------
// PostResponse (POST /{bucket} with success_action_status=201)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "PostResponse")]
struct PostResponse<'a> {
    #[serde(rename = "Bucket")]
    bucket: &'a str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Location")]
    location: &'a str,
}

pub(crate) fn post_response(bucket: &str, key: &str, etag: &str, location: &str) -> String {
    quick_xml::se::to_string(&PostResponse {
        bucket,
        key,
        etag: format!("\"{etag}\""),
        location,
    })
    .expect("post response xml contains only safe strings")
}

// -----------------------------------------------------------------------
// ListMultipartUploadsResult (GET /{bucket}?uploads)
// -----------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename = "ListMultipartUploadsResult")]
struct ListMultipartUploadsResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "KeyMarker")]
    key_marker: String,
    #[serde(rename = "Prefix")]
    prefix: String,
    #[serde(rename = "MaxUploads")]
    max_uploads: usize,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(rename = "Upload")]
    uploads: Vec<UploadEntry>,
}

#[derive(Serialize)]
struct UploadEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "UploadId")]
    upload_id: String,
    #[serde(rename = "Initiated", skip_serializing_if = "String::is_empty")]
    initiated: String,
}

pub(crate) fn list_multipart_uploads(bucket: &str, info: &ListMultipartsInfo) -> String {
    quick_xml::se::to_string(&ListMultipartUploadsResult {
        xmlns: S3_XMLNS,
        bucket: bucket.to_string(),
        key_marker: info.key_marker.clone(),
        prefix: info.prefix.clone(),
        max_uploads: info.max_uploads,
        is_truncated: info.is_truncated,
        uploads: info
            .uploads
            .iter()
            .map(|u| UploadEntry {
                key: u.object.clone(),
                upload_id: u.upload_id.clone(),
                initiated: u.initiated.map(iso8601).unwrap_or_default(),
            })
            .collect(),
    })
    .expect("multipart list xml contains only safe strings")
}

// -----------------------------------------------------------------------
// Tagging (PUT/GET /{bucket}?tagging)
// -----------------------------------------------------------------------

/// `<Tagging>` document, parsed and re-serialized for the bucket tag
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "Tagging")]
pub(crate) struct Tagging {
    #[serde(rename = "TagSet")]
    pub tag_set: TagSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagSet {
    #[serde(rename = "Tag", default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Tag {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

pub(crate) fn parse_tagging(body: &[u8]) -> Result<Tagging, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub(crate) fn tagging_xml(tagging: &Tagging) -> String {
    quick_xml::se::to_string(tagging).expect("tagging xml contains only safe strings")
}

// -----------------------------------------------------------------------
// ObjectLockConfiguration (PUT/GET /{bucket}?object-lock)
// -----------------------------------------------------------------------

/// `<ObjectLockConfiguration>` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "ObjectLockConfiguration")]
pub(crate) struct ObjectLockConfiguration {
    #[serde(rename = "ObjectLockEnabled")]
    pub object_lock_enabled: String,
    #[serde(rename = "Rule", default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ObjectLockRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ObjectLockRule {
    #[serde(rename = "DefaultRetention")]
    pub default_retention: DefaultRetention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DefaultRetention {
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "Days", default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    #[serde(rename = "Years", default, skip_serializing_if = "Option::is_none")]
    pub years: Option<u32>,
}

pub(crate) fn parse_object_lock_config(
    body: &[u8],
) -> Result<ObjectLockConfiguration, quick_xml::DeError> {
    quick_xml::de::from_reader(body)
}

pub(crate) fn object_lock_config_xml(config: &ObjectLockConfiguration) -> String {
    quick_xml::se::to_string(config).expect("object lock xml contains only safe strings")
}
