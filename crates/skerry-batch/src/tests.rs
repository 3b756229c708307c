//! End-to-end engine tests over the in-memory object layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use skerry_io::{seal_metadata, LocalKms, SseKind};
use skerry_object::memory::MemObjectLayer;
use skerry_object::services::{CoreServices, Kms, KmsContext};
use skerry_object::{MakeBucketOptions, ObjectLayer, ObjectOptions};
use skerry_types::{META_OBJECT_TAGGING, META_SSE_KMS_KEY_ID, META_SSE_SEALED_KEY};

use crate::{
    BatchError, BatchJobInfo, BatchJobRequest, BatchJobsMetrics, CheckpointStore,
    KeyRotateEncryption, KeyRotateJob, KeyRotateKV, KeyRotationType,
};

fn services_with_kms() -> (CoreServices, Arc<LocalKms>) {
    let kms = Arc::new(LocalKms::new([11u8; 32], "default-kek"));
    let mut services = CoreServices::single_node("AKIABATCH");
    services.kms = Some(kms.clone());
    (services, kms)
}

async fn seed_object(
    layer: &Arc<MemObjectLayer>,
    kms: &LocalKms,
    bucket: &str,
    name: &str,
    kind: SseKind,
    key_id: &str,
    extra: &[(&str, &str)],
) {
    let context = KmsContext::new();
    let data_key = kms.generate_key(key_id, &context).await.unwrap();
    let mut metadata = BTreeMap::new();
    seal_metadata(&mut metadata, kind, &data_key, &context);
    for (k, v) in extra {
        metadata.insert(k.to_string(), v.to_string());
    }
    let mut body: &[u8] = b"sealed payload";
    layer
        .put_object(
            bucket,
            name,
            &mut body,
            &ObjectOptions {
                user_defined: metadata,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

fn rotate_to_kms(bucket: &str, key: &str) -> KeyRotateJob {
    KeyRotateJob {
        api_version: "v1".to_string(),
        bucket: bucket.to_string(),
        prefix: String::new(),
        encryption: KeyRotateEncryption {
            kind: KeyRotationType::SseKms,
            key: key.to_string(),
            context: String::new(),
        },
        flags: Default::default(),
    }
}

fn request(id: &str, job: &KeyRotateJob) -> BatchJobRequest {
    BatchJobRequest {
        id: id.to_string(),
        started: chrono::Utc::now(),
        job: job.clone(),
    }
}

async fn run(
    job: &KeyRotateJob,
    layer: &Arc<MemObjectLayer>,
    services: &CoreServices,
    dir: &std::path::Path,
    id: &str,
) -> BatchJobInfo {
    let store = Arc::new(CheckpointStore::new(dir));
    let metrics = Arc::new(BatchJobsMetrics::new());
    let req = request(id, job);
    let layer: Arc<dyn skerry_object::ObjectLayer> = layer.clone();
    job.start(layer, services.clone(), &req, store.clone(), metrics.clone())
        .await
        .unwrap();
    metrics.get(id).unwrap()
}

#[tokio::test]
async fn rotates_every_matching_object_and_is_idempotent() {
    let (services, kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();
    for i in 0..20 {
        seed_object(
            &layer,
            &kms,
            "photos",
            &format!("obj-{i:02}"),
            SseKind::S3,
            "",
            &[],
        )
        .await;
    }

    let job = rotate_to_kms("photos", "key-x");
    job.validate(layer.as_ref(), services.kms.as_ref())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let info = run(&job, &layer, &services, dir.path(), "job-1").await;
    assert_eq!(info.objects, 20);
    assert_eq!(info.objects_failed, 0);
    assert!(info.complete);
    assert!(!info.failed);

    // Every object is now sealed under the new KEK and the sealed data
    // key still unseals.
    for i in 0..20 {
        let obj = layer
            .get_object_info("photos", &format!("obj-{i:02}"), &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(
            obj.user_defined.get(META_SSE_KMS_KEY_ID).unwrap(),
            "key-x"
        );
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(obj.user_defined.get(META_SSE_SEALED_KEY).unwrap())
            .unwrap();
        kms.decrypt_key("key-x", &sealed, &KmsContext::new())
            .await
            .expect("rotated key must unseal under the new KEK");
    }

    // Re-running the same definition as a fresh job is a clean no-op
    // pass: everything rotates again without failures.
    let info = run(&job, &layer, &services, dir.path(), "job-2").await;
    assert_eq!(info.objects, 20);
    assert_eq!(info.objects_failed, 0);
    assert!(info.complete);
}

#[tokio::test]
async fn resumes_from_the_checkpoint_cursor() {
    let (services, kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();
    for i in 0..10 {
        seed_object(
            &layer,
            &kms,
            "photos",
            &format!("obj-{i:02}"),
            SseKind::S3,
            "",
            &[],
        )
        .await;
    }

    let job = rotate_to_kms("photos", "key-x");
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path()));

    // Simulate a crash after obj-04 was dispatched: the cursor is the
    // last dispatched object and the walk resumes from it inclusively,
    // re-rotating the possibly in-flight object.
    let mut crashed = BatchJobInfo::new("job-r", "keyrotate");
    crashed.advance_cursor("photos", "obj-04");
    crashed.objects = 4;
    store
        .update_after(&mut crashed, std::time::Duration::ZERO)
        .await
        .unwrap();

    let metrics = Arc::new(BatchJobsMetrics::new());
    let req = request("job-r", &job);
    let layer_dyn: Arc<dyn skerry_object::ObjectLayer> = layer.clone();
    job.start(layer_dyn, services.clone(), &req, store, metrics.clone())
        .await
        .unwrap();

    let info = metrics.get("job-r").unwrap();
    // 4 already done + obj-04..obj-09 processed on resume.
    assert_eq!(info.objects, 10);
    assert_eq!(info.objects_failed, 0);
    assert!(info.complete);
}

#[tokio::test]
async fn filters_are_pushed_down_to_the_walk() {
    let (services, kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();
    seed_object(
        &layer,
        &kms,
        "photos",
        "tagged",
        SseKind::S3,
        "",
        &[(META_OBJECT_TAGGING, "team=infra&tier=hot")],
    )
    .await;
    seed_object(&layer, &kms, "photos", "untagged", SseKind::S3, "", &[]).await;

    let mut job = rotate_to_kms("photos", "key-x");
    job.flags.filter.tags = vec![KeyRotateKV {
        key: "team".into(),
        value: "infra".into(),
    }];

    let dir = tempfile::tempdir().unwrap();
    let info = run(&job, &layer, &services, dir.path(), "job-f").await;
    assert_eq!(info.objects, 1);

    let tagged = layer
        .get_object_info("photos", "tagged", &ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(tagged.user_defined.get(META_SSE_KMS_KEY_ID).unwrap(), "key-x");

    let untagged = layer
        .get_object_info("photos", "untagged", &ObjectOptions::default())
        .await
        .unwrap();
    assert!(
        !untagged.user_defined.contains_key(META_SSE_KMS_KEY_ID),
        "non-matching objects must be untouched"
    );
}

#[tokio::test]
async fn kms_to_s3_transitions_are_refused() {
    let (services, kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();
    seed_object(&layer, &kms, "photos", "kms-obj", SseKind::Kms, "key-a", &[]).await;

    let job = KeyRotateJob {
        api_version: "v1".to_string(),
        bucket: "photos".to_string(),
        prefix: String::new(),
        encryption: KeyRotateEncryption {
            kind: KeyRotationType::SseS3,
            key: String::new(),
            context: String::new(),
        },
        flags: Default::default(),
    };

    let dir = tempfile::tempdir().unwrap();
    let info = run(&job, &layer, &services, dir.path(), "job-k").await;
    assert_eq!(info.objects, 0);
    assert_eq!(info.objects_failed, 1);
    assert!(info.failed);
    assert!(!info.complete);
}

#[tokio::test]
async fn validation_rejects_bad_definitions() {
    let (services, _kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();

    // Wrong api version.
    let mut job = rotate_to_kms("photos", "key-x");
    job.api_version = "v2".to_string();
    assert!(matches!(
        job.validate(layer.as_ref(), services.kms.as_ref()).await,
        Err(BatchError::InvalidArgument)
    ));

    // Unknown source bucket surfaces as the batch job error.
    let job = rotate_to_kms("missing", "key-x");
    match job.validate(layer.as_ref(), services.kms.as_ref()).await {
        Err(BatchError::JobError { code, status, .. }) => {
            assert_eq!(code, "NoSuchSourceBucket");
            assert_eq!(status, 404);
        }
        other => panic!("expected NoSuchSourceBucket, got {other:?}"),
    }

    // Filter keys must be non-empty.
    let mut job = rotate_to_kms("photos", "key-x");
    job.flags.filter.tags = vec![KeyRotateKV {
        key: String::new(),
        value: "x".into(),
    }];
    assert!(matches!(
        job.validate(layer.as_ref(), services.kms.as_ref()).await,
        Err(BatchError::InvalidArgument)
    ));

    // Padded KMS key ids are rejected before touching the KMS.
    let job = rotate_to_kms("photos", " padded ");
    assert!(matches!(
        job.validate(layer.as_ref(), services.kms.as_ref()).await,
        Err(BatchError::InvalidKmsKeyId(_))
    ));

    // No KMS configured at all.
    let job = rotate_to_kms("photos", "key-x");
    assert!(matches!(
        job.validate(layer.as_ref(), None).await,
        Err(BatchError::KmsNotConfigured)
    ));
}

#[tokio::test]
async fn completion_is_posted_to_the_notification_endpoint() {
    use axum::routing::post;

    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<(String, String)>(1);
    let app = axum::Router::new().route(
        "/hook",
        post(move |headers: axum::http::HeaderMap, body: String| {
            let tx = notify_tx.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = tx.send((auth, body)).await;
                axum::http::StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (services, kms) = services_with_kms();
    let layer = MemObjectLayer::new();
    layer
        .make_bucket("photos", MakeBucketOptions::default())
        .await
        .unwrap();
    seed_object(&layer, &kms, "photos", "one", SseKind::S3, "", &[]).await;

    let mut job = rotate_to_kms("photos", "key-x");
    job.flags.notify.endpoint = format!("http://{addr}/hook");
    job.flags.notify.token = "Bearer hook-token".to_string();

    let dir = tempfile::tempdir().unwrap();
    run(&job, &layer, &services, dir.path(), "job-n").await;

    let (auth, body) = notify_rx.recv().await.unwrap();
    assert_eq!(auth, "Bearer hook-token");
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["job_id"], "job-n");
    assert_eq!(report["complete"], true);
    assert_eq!(report["objects"], 1);
}
