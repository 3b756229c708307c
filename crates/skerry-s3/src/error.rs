//! S3-compatible API errors and their XML rendering.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use skerry_object::services::AuthError;
use skerry_object::ObjectError;
use skerry_storage::StorageError;

use crate::xml;

/// Header carrying the error code on body-less (HEAD) error responses.
pub const ERR_CODE_HEADER: &str = "x-skerry-error-code";
/// Header carrying the error description on body-less error responses.
pub const ERR_DESC_HEADER: &str = "x-skerry-error-desc";

/// An S3 wire error: code, human description and HTTP status, plus the
/// bucket/object context rendered into the XML document.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// S3 error code, e.g. `NoSuchBucket`.
    pub code: &'static str,
    /// Human-readable description.
    pub description: String,
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Bucket context, when known.
    pub bucket: String,
    /// Object context, when known.
    pub object: String,
}

macro_rules! api_errors {
    ($($fn_name:ident => ($code:literal, $status:expr, $desc:literal);)*) => {
        impl ApiError {
            $(
                #[doc = concat!("`", $code, "`")]
                pub fn $fn_name() -> Self {
                    Self {
                        code: $code,
                        description: $desc.to_string(),
                        status: $status,
                        bucket: String::new(),
                        object: String::new(),
                    }
                }
            )*
        }
    };
}

api_errors! {
    server_not_initialized => ("ServerNotInitialized", StatusCode::SERVICE_UNAVAILABLE, "Server not initialized, please try again");
    access_denied => ("AccessDenied", StatusCode::FORBIDDEN, "Access Denied");
    invalid_access_key_id => ("InvalidAccessKeyId", StatusCode::FORBIDDEN, "The Access Key Id you provided does not exist in our records");
    signature_does_not_match => ("SignatureDoesNotMatch", StatusCode::FORBIDDEN, "The request signature we calculated does not match the signature you provided");
    no_such_bucket => ("NoSuchBucket", StatusCode::NOT_FOUND, "The specified bucket does not exist");
    no_such_key => ("NoSuchKey", StatusCode::NOT_FOUND, "The specified key does not exist");
    no_such_version => ("NoSuchVersion", StatusCode::NOT_FOUND, "The specified version does not exist");
    bucket_already_exists => ("BucketAlreadyExists", StatusCode::CONFLICT, "The requested bucket name is not available");
    bucket_already_owned_by_you => ("BucketAlreadyOwnedByYou", StatusCode::CONFLICT, "Your previous request to create the named bucket succeeded and you already own it");
    bucket_not_empty => ("BucketNotEmpty", StatusCode::CONFLICT, "The bucket you tried to delete is not empty");
    malformed_xml => ("MalformedXML", StatusCode::BAD_REQUEST, "The XML you provided was not well-formed or did not validate against our published schema");
    malformed_post_request => ("MalformedPOSTRequest", StatusCode::BAD_REQUEST, "The body of your POST request is not well-formed multipart/form-data");
    invalid_request => ("InvalidRequest", StatusCode::BAD_REQUEST, "Invalid Request");
    invalid_argument => ("InvalidArgument", StatusCode::BAD_REQUEST, "Invalid argument");
    missing_content_md5 => ("MissingContentMD5", StatusCode::BAD_REQUEST, "Missing required header for this request: Content-Md5");
    missing_content_length => ("MissingContentLength", StatusCode::LENGTH_REQUIRED, "You must provide the Content-Length HTTP header");
    entity_too_large => ("EntityTooLarge", StatusCode::BAD_REQUEST, "Your proposed upload exceeds the maximum allowed object size");
    entity_too_small => ("EntityTooSmall", StatusCode::BAD_REQUEST, "Your proposed upload is smaller than the minimum allowed object size");
    method_not_allowed => ("MethodNotAllowed", StatusCode::METHOD_NOT_ALLOWED, "The specified method is not allowed against this resource");
    not_implemented => ("NotImplemented", StatusCode::NOT_IMPLEMENTED, "A header you provided implies functionality that is not implemented");
    invalid_max_uploads => ("InvalidArgument", StatusCode::BAD_REQUEST, "Argument max-uploads must be an integer between 0 and 2147483647");
    bad_digest => ("BadDigest", StatusCode::BAD_REQUEST, "The Content-Md5 you specified did not match what we received");
    invalid_digest => ("InvalidDigest", StatusCode::BAD_REQUEST, "The Content-Md5 you specified is not valid");
    kms_not_configured => ("KMS.NotFoundException", StatusCode::BAD_REQUEST, "Invalid keyId");
    operation_timed_out => ("RequestTimeout", StatusCode::REQUEST_TIMEOUT, "A timeout occurred while trying to lock a resource, please reduce your request rate");
    post_policy_invalid => ("PostPolicyInvalidKeyName", StatusCode::FORBIDDEN, "Invalid according to Policy: Policy Condition failed");
    object_lock_config_not_found => ("ObjectLockConfigurationNotFoundError", StatusCode::NOT_FOUND, "Object Lock configuration does not exist for this bucket");
    no_such_tag_set => ("NoSuchTagSet", StatusCode::NOT_FOUND, "The TagSet does not exist");
    internal_error => ("InternalError", StatusCode::INTERNAL_SERVER_ERROR, "We encountered an internal error, please try again");
}

impl ApiError {
    /// Attach bucket context.
    pub fn bucket(mut self, bucket: &str) -> Self {
        self.bucket = bucket.to_string();
        self
    }

    /// Attach object context.
    pub fn object(mut self, object: &str) -> Self {
        self.object = object.to_string();
        self
    }

    /// Append detail to the description, the way parse errors carry their
    /// cause.
    pub fn because(mut self, detail: impl std::fmt::Display) -> Self {
        self.description = format!("{} ({detail})", self.description);
        self
    }

    /// Replace the description verbatim.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Render as a body-less response with the code and description in
    /// `x-skerry-error-*` headers (HEAD responses cannot carry a body).
    pub fn into_headers_only(self) -> axum::response::Response {
        Response::builder()
            .status(self.status)
            .header(ERR_CODE_HEADER, self.code)
            .header(ERR_DESC_HEADER, format!("\"{}\"", self.description))
            .body(Body::empty())
            .expect("error response construction cannot fail")
    }
}

/// Map an object-layer error to its wire form with context.
pub fn to_api_error(err: ObjectError, bucket: &str, object: &str) -> ApiError {
    let api = match &err {
        ObjectError::BucketNotFound { .. } => ApiError::no_such_bucket(),
        ObjectError::BucketExists { .. } => ApiError::bucket_already_exists(),
        ObjectError::BucketNotEmpty { .. } => ApiError::bucket_not_empty(),
        ObjectError::ObjectNotFound { .. } => ApiError::no_such_key(),
        ObjectError::VersionNotFound { .. } => ApiError::no_such_version(),
        ObjectError::InvalidArgument => ApiError::invalid_argument(),
        ObjectError::InvalidVersionId { version_id } => {
            ApiError::no_such_version().because(format!("invalid version id {version_id}"))
        }
        ObjectError::InvalidEncryptionParameters => ApiError::invalid_request()
            .with_description("The encryption parameters are not applicable to this object"),
        ObjectError::InvalidEncryptionParametersSsec => ApiError::invalid_request()
            .with_description("SSE-C encryption is not supported on replicated buckets"),
        ObjectError::KmsNotConfigured => ApiError::kms_not_configured(),
        ObjectError::LockTimeout { .. } => ApiError::operation_timed_out(),
        ObjectError::Storage(storage) => return storage_to_api_error(storage, bucket, object),
    };
    api.bucket(bucket).object(object)
}

fn storage_to_api_error(err: &StorageError, bucket: &str, object: &str) -> ApiError {
    let api = match err {
        StorageError::VolumeNotFound => ApiError::no_such_bucket(),
        StorageError::VolumeExists => ApiError::bucket_already_exists(),
        StorageError::VolumeNotEmpty => ApiError::bucket_not_empty(),
        StorageError::FileNotFound | StorageError::PathNotFound => ApiError::no_such_key(),
        StorageError::FileVersionNotFound => ApiError::no_such_version(),
        StorageError::FileAccessDenied | StorageError::VolumeAccessDenied => {
            ApiError::access_denied()
        }
        StorageError::InvalidAccessKeyId => ApiError::invalid_access_key_id(),
        StorageError::Authentication => ApiError::access_denied(),
        _ => ApiError::internal_error(),
    };
    api.bucket(bucket).object(object)
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidAccessKeyId => ApiError::invalid_access_key_id(),
            AuthError::SignatureDoesNotMatch => ApiError::signature_does_not_match(),
            AuthError::AccessDenied => ApiError::access_denied(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = xml::error_xml(&self);
        Response::builder()
            .status(self.status)
            .header("content-type", "application/xml")
            .body(Body::from(body))
            .expect("error response construction cannot fail")
    }
}
