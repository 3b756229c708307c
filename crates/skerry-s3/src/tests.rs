//! Router-level tests driven through `tower::ServiceExt`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use skerry_object::memory::MemObjectLayer;
use skerry_object::services::{
    action, CoreServices, DnsStore, MemoryBucketMetadata, MemoryDnsStore, StaticPolicyEngine,
    StaticVersioning,
};
use skerry_object::{MakeBucketOptions, ObjectLayer, ObjectOptions};
use skerry_types::events::{BucketCreated, ObjectCreatedPost, ObjectRemovedDelete};
use tower::ServiceExt;

use crate::{S3Server, S3ServerConfig};

const ACCESS_KEY: &str = "AKIASKERRYTEST";
const AUTH: &str = "AWS4-HMAC-SHA256 Credential=AKIASKERRYTEST/20240101/us-east-1/s3/aws4_request";

struct TestEnv {
    app: Router,
    layer: Arc<MemObjectLayer>,
    services: CoreServices,
    iam: Arc<StaticPolicyEngine>,
    versioning: Arc<StaticVersioning>,
    bucket_meta: Arc<MemoryBucketMetadata>,
}

fn env() -> TestEnv {
    env_with_dns(None)
}

fn env_with_dns(dns: Option<Arc<MemoryDnsStore>>) -> TestEnv {
    let iam = Arc::new(StaticPolicyEngine::new(ACCESS_KEY));
    let versioning = Arc::new(StaticVersioning::new());
    let bucket_meta = Arc::new(MemoryBucketMetadata::new());
    let mut services = CoreServices::single_node(ACCESS_KEY);
    services.iam = iam.clone();
    services.versioning = versioning.clone();
    services.bucket_meta = bucket_meta.clone();
    services.local_ips = ["10.0.0.1".to_string()].into_iter().collect();
    if let Some(dns) = dns {
        services.dns = Some(dns);
    }

    let server = S3Server::new(S3ServerConfig {
        services: services.clone(),
    });
    let layer = MemObjectLayer::new();
    server.set_object_layer(layer.clone());
    TestEnv {
        app: server.into_router(),
        layer,
        services,
        iam,
        versioning,
        bucket_meta,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn delete_request(bucket: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/{bucket}?delete"))
        .header("authorization", AUTH)
        .header("content-md5", "ignored")
        .header("content-length", body.len().to_string())
        .body(Body::from(body.to_string()))
        .unwrap()
}

// -----------------------------------------------------------------------
// Readiness and bucket lifecycle
// -----------------------------------------------------------------------

#[tokio::test]
async fn requests_before_init_fail_server_not_initialized() {
    let server = S3Server::new(S3ServerConfig {
        services: CoreServices::single_node(ACCESS_KEY),
    });
    let app = server.into_router();
    let req = Request::builder()
        .uri("/")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("ServerNotInitialized"));
}

#[tokio::test]
async fn put_bucket_sets_location_and_emits_event() {
    let env = env();
    let mut events = env.services.events.subscribe::<BucketCreated>();

    let req = Request::builder()
        .method("PUT")
        .uri("/photos")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("location").unwrap(), "/photos");
    assert_eq!(events.recv().await.unwrap().bucket, "photos");

    // Second creation conflicts.
    let req = Request::builder()
        .method("PUT")
        .uri("/photos")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("BucketAlreadyExists"));
}

#[tokio::test]
async fn anonymous_list_buckets_is_rejected() {
    let env = env();
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("AccessDenied"));
}

#[tokio::test]
async fn head_bucket_signals_errors_via_headers() {
    let env = env();
    let req = Request::builder()
        .method("HEAD")
        .uri("/missing")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get("x-skerry-error-code").unwrap(), "NoSuchBucket");
    assert!(headers.contains_key("x-skerry-error-desc"));
    assert!(body.is_empty(), "HEAD errors must not carry a body");
}

#[tokio::test]
async fn policy_status_serializes_uppercase_booleans() {
    let env = env();
    env.layer
        .make_bucket("pub", MakeBucketOptions::default())
        .await
        .unwrap();
    let req = Request::builder()
        .uri("/pub?policyStatus")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<IsPublic>FALSE</IsPublic>"));
}

#[tokio::test]
async fn force_delete_refused_on_locked_or_replicated_buckets() {
    let env = env();
    env.layer
        .make_bucket("locked", MakeBucketOptions { lock_enabled: true, force_create: false })
        .await
        .unwrap();
    env.bucket_meta.enable_lock("locked");

    let req = Request::builder()
        .method("DELETE")
        .uri("/locked")
        .header("authorization", AUTH)
        .header("x-skerry-force-delete", "true")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(body.contains("MethodNotAllowed"));
}

#[tokio::test]
async fn bucket_not_empty_message_mentions_versions_when_versioned() {
    let env = env();
    env.layer
        .make_bucket("docs", MakeBucketOptions::default())
        .await
        .unwrap();
    let mut data: &[u8] = b"x";
    env.layer
        .put_object("docs", "a", &mut data, &ObjectOptions::default())
        .await
        .unwrap();
    env.versioning.enable("docs");

    let req = Request::builder()
        .method("DELETE")
        .uri("/docs")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("delete all versions"));
}

// -----------------------------------------------------------------------
// Federation
// -----------------------------------------------------------------------

#[tokio::test]
async fn put_bucket_federation_distinguishes_ownership() {
    // A record under our IP: BucketAlreadyOwnedByYou.
    let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
    dns.seed("mine", vec!["10.0.0.1".to_string()]);
    dns.seed("theirs", vec!["192.168.9.9".to_string()]);
    let env = env_with_dns(Some(dns.clone()));

    let req = Request::builder()
        .method("PUT")
        .uri("/mine")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("BucketAlreadyOwnedByYou"));

    let req = Request::builder()
        .method("PUT")
        .uri("/theirs")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("BucketAlreadyExists"));

    // A fresh name registers in the directory.
    let req = Request::builder()
        .method("PUT")
        .uri("/fresh")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(dns.get("fresh").await.is_ok());
}

// -----------------------------------------------------------------------
// Multi-delete
// -----------------------------------------------------------------------

#[tokio::test]
async fn multi_delete_dedupes_and_preserves_order() {
    let env = env();
    env.layer
        .make_bucket("b", MakeBucketOptions::default())
        .await
        .unwrap();
    for name in ["a", "b"] {
        let mut data: &[u8] = b"content";
        env.layer
            .put_object("b", name, &mut data, &ObjectOptions::default())
            .await
            .unwrap();
    }
    let mut events = env.services.events.subscribe::<ObjectRemovedDelete>();

    // "a" appears twice; the duplicate collapses.
    let body = r#"<Delete>
        <Object><Key>a</Key></Object>
        <Object><Key>b</Key></Object>
        <Object><Key>a</Key></Object>
    </Delete>"#;
    let (status, _, response) = send(&env.app, delete_request("b", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.matches("<Deleted>").count(), 2);
    assert!(!response.contains("<Error>"));

    // An event per deleted object.
    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    let mut names = vec![first.object, second.object];
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn multi_delete_missing_objects_count_as_deleted() {
    let env = env();
    env.layer
        .make_bucket("b", MakeBucketOptions::default())
        .await
        .unwrap();

    let body = r#"<Delete><Object><Key>ghost</Key></Object></Delete>"#;
    let (status, _, response) = send(&env.app, delete_request("b", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.matches("<Deleted>").count(), 1);
    assert!(!response.contains("<Error>"));
}

#[tokio::test]
async fn multi_delete_per_object_denial_is_a_per_entry_error() {
    let env = env();
    env.layer
        .make_bucket("b", MakeBucketOptions::default())
        .await
        .unwrap();
    for name in ["a", "b"] {
        let mut data: &[u8] = b"content";
        env.layer
            .put_object("b", name, &mut data, &ObjectOptions::default())
            .await
            .unwrap();
    }
    env.iam.deny(action::DELETE_OBJECT, "b");

    let body = r#"<Delete>
        <Object><Key>a</Key></Object>
        <Object><Key>b</Key></Object>
    </Delete>"#;
    let (status, _, response) = send(&env.app, delete_request("b", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.matches("<Deleted>").count(), 1);
    assert!(response.contains("<Error>"));
    assert!(response.contains("AccessDenied"));
    assert!(response.contains("<Key>b</Key>"));

    // The allowed object actually went away.
    assert!(env.layer.raw_object("b", "a").await.is_none());
    assert!(env.layer.raw_object("b", "b").await.is_some());
}

#[tokio::test]
async fn multi_delete_protocol_preconditions() {
    let env = env();
    env.layer
        .make_bucket("b", MakeBucketOptions::default())
        .await
        .unwrap();

    // Missing Content-MD5.
    let body = r#"<Delete><Object><Key>a</Key></Object></Delete>"#;
    let req = Request::builder()
        .method("POST")
        .uri("/b?delete")
        .header("authorization", AUTH)
        .header("content-length", body.len().to_string())
        .body(Body::from(body))
        .unwrap();
    let (status, _, response) = send(&env.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("MissingContentMD5"));

    // Zero entries.
    let (status, _, response) = send(&env.app, delete_request("b", "<Delete></Delete>")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("MalformedXML"));

    // Too many entries.
    let mut body = String::from("<Delete>");
    for i in 0..1001 {
        body.push_str(&format!("<Object><Key>k{i}</Key></Object>"));
    }
    body.push_str("</Delete>");
    let (status, _, response) = send(&env.app, delete_request("b", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("MalformedXML"));

    // Malformed version IDs are per-entry NoSuchVersion errors.
    let body = r#"<Delete><Object><Key>a</Key><VersionId>not-a-uuid</VersionId></Object></Delete>"#;
    let (status, _, response) = send(&env.app, delete_request("b", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("NoSuchVersion"));
}

#[tokio::test]
async fn multi_delete_versioned_creates_markers() {
    let env = env();
    env.layer
        .make_bucket("docs", MakeBucketOptions::default())
        .await
        .unwrap();
    env.versioning.enable("docs");
    let opts = ObjectOptions {
        versioned: true,
        ..Default::default()
    };
    let mut data: &[u8] = b"v1";
    let put = env.layer.put_object("docs", "a", &mut data, &opts).await.unwrap();

    // Latest-version delete leaves a marker; targeted delete removes the
    // version itself.
    let body = r#"<Delete><Object><Key>a</Key></Object></Delete>"#;
    let (status, _, response) = send(&env.app, delete_request("docs", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains("<DeleteMarker>true</DeleteMarker>"));

    let body = format!(
        "<Delete><Object><Key>a</Key><VersionId>{}</VersionId></Object></Delete>",
        put.version_id
    );
    let (status, _, response) = send(&env.app, delete_request("docs", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response.contains(&put.version_id));
    assert!(!response.contains("<Error>"));
}

// -----------------------------------------------------------------------
// POST policy uploads
// -----------------------------------------------------------------------

const BOUNDARY: &str = "skerryformboundary";

fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some((filename, content)) = file {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn post_request(bucket: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/{bucket}"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn post_policy_upload_stores_object() {
    let env = env();
    env.layer
        .make_bucket("uploads", MakeBucketOptions::default())
        .await
        .unwrap();

    let body = multipart_body(
        &[
            ("key", "incoming/${filename}"),
            ("x-amz-credential", ACCESS_KEY),
            ("x-amz-meta-origin", "browser"),
        ],
        Some(("report.txt", b"quarterly numbers")),
    );
    let (status, headers, _) = send(&env.app, post_request("uploads", body)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(headers.contains_key("etag"));
    assert_eq!(headers.get("location").unwrap(), "/uploads/incoming/report.txt");

    let stored = env.layer.raw_object("uploads", "incoming/report.txt").await;
    assert_eq!(stored.unwrap(), b"quarterly numbers");
}

#[tokio::test]
async fn post_policy_success_action_status_201_returns_xml() {
    let env = env();
    env.layer
        .make_bucket("uploads", MakeBucketOptions::default())
        .await
        .unwrap();

    let body = multipart_body(
        &[
            ("key", "a.bin"),
            ("x-amz-credential", ACCESS_KEY),
            ("success_action_status", "201"),
        ],
        Some(("a.bin", b"abc")),
    );
    let (status, _, response) = send(&env.app, post_request("uploads", body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(response.contains("<PostResponse>"));
    assert!(response.contains("<Key>a.bin</Key>"));
}

#[tokio::test]
async fn post_policy_missing_key_and_missing_file() {
    let env = env();
    env.layer
        .make_bucket("uploads", MakeBucketOptions::default())
        .await
        .unwrap();

    // No Key field.
    let body = multipart_body(&[("x-amz-credential", ACCESS_KEY)], Some(("f", b"x")));
    let (status, _, response) = send(&env.app, post_request("uploads", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("MalformedPOSTRequest"));
    assert!(response.contains("name of the uploaded key is missing"));

    // No file part.
    let body = multipart_body(&[("key", "a"), ("x-amz-credential", ACCESS_KEY)], None);
    let (status, _, response) = send(&env.app, post_request("uploads", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("file or text content is missing"));
}

#[tokio::test]
async fn post_policy_conditions_are_enforced() {
    use base64::Engine as _;
    let env = env();
    env.layer
        .make_bucket("uploads", MakeBucketOptions::default())
        .await
        .unwrap();

    let policy = base64::engine::general_purpose::STANDARD.encode(
        r#"{"expiration": "2099-01-01T00:00:00Z",
            "conditions": [["starts-with", "$key", "allowed/"]]}"#,
    );
    let body = multipart_body(
        &[
            ("key", "forbidden/a"),
            ("x-amz-credential", ACCESS_KEY),
            ("policy", &policy),
        ],
        Some(("a", b"x")),
    );
    let (status, _, response) = send(&env.app, post_request("uploads", body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(response.contains("AccessDenied"));
}

// -----------------------------------------------------------------------
// Fan-out
// -----------------------------------------------------------------------

#[tokio::test]
async fn fanout_writes_identical_objects_in_order() {
    let env = env();
    env.layer
        .make_bucket("media", MakeBucketOptions::default())
        .await
        .unwrap();
    let mut events = env.services.events.subscribe::<ObjectCreatedPost>();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let body = multipart_body(
        &[
            ("key", "unused"),
            ("x-amz-credential", ACCESS_KEY),
            (
                "x-skerry-fanout-list",
                r#"[{"key":"k1"},{"key":"k2"},{"key":"k3"}]"#,
            ),
        ],
        Some(("blob", &payload)),
    );
    let (status, headers, response) = send(&env.app, post_request("media", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");

    // One JSON line per destination, in input order.
    let lines: Vec<&str> = response.lines().collect();
    assert_eq!(lines.len(), 3);
    for (line, key) in lines.iter().zip(["k1", "k2", "k3"]) {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["key"], key);
        assert!(parsed.get("error").is_none());
        assert!(parsed["etag"].as_str().is_some());
    }

    // Identical plaintext everywhere, and one event per destination.
    for key in ["k1", "k2", "k3"] {
        assert_eq!(env.layer.raw_object("media", key).await.unwrap(), payload);
        assert!(events.recv().await.is_some());
    }

    // Same input bytes, same ETag.
    let l1: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    let l2: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(l1["etag"], l2["etag"]);
}

#[tokio::test]
async fn fanout_rejects_oversize_input_before_writing() {
    let env = env();
    env.layer
        .make_bucket("media", MakeBucketOptions::default())
        .await
        .unwrap();

    let payload = vec![7u8; 17 * 1024 * 1024]; // over the 16 MiB cap
    let body = multipart_body(
        &[
            ("key", "unused"),
            ("x-amz-credential", ACCESS_KEY),
            ("x-skerry-fanout-list", r#"[{"key":"big"}]"#),
        ],
        Some(("blob", &payload)),
    );
    let (status, _, response) = send(&env.app, post_request("media", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.contains("MalformedPOSTRequest"));
    assert!(env.layer.raw_object("media", "big").await.is_none());
}

#[tokio::test]
async fn fanout_with_sse_c_is_not_implemented() {
    let env = env();
    env.layer
        .make_bucket("media", MakeBucketOptions::default())
        .await
        .unwrap();

    let body = multipart_body(
        &[
            ("key", "unused"),
            ("x-amz-credential", ACCESS_KEY),
            ("x-amz-server-side-encryption-customer-algorithm", "AES256"),
            (
                "x-amz-server-side-encryption-customer-key",
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
            ),
            ("x-skerry-fanout-list", r#"[{"key":"k1"}]"#),
        ],
        Some(("blob", b"data")),
    );
    let (status, _, response) = send(&env.app, post_request("media", body)).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(response.contains("NotImplemented"));
}
