//! Client tests against an in-process storage RPC server.

use axum::body::Body;
use axum::extract::{Query, RawQuery};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use skerry_types::{DiskInfo, Endpoint};
use tokio::sync::mpsc;

use crate::frames;
use crate::wire::{DataUsageCache, DataUsageEntry, DeleteVersionsResp, StatInfo};
use crate::{RemoteDisk, StorageError, STORAGE_REST_PREFIX};

/// Spin up a fake storage peer and return the client pointed at it.
async fn fake_peer(app: Router) -> RemoteDisk {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    RemoteDisk::new(Endpoint::new("http", addr.to_string(), "/mnt/disk1"), false)
}

fn route(rpc: &str) -> String {
    format!("{STORAGE_REST_PREFIX}/mnt/disk1/{rpc}")
}

#[tokio::test]
async fn disk_info_decodes_and_caches() {
    let app = Router::new().route(
        &route("disk-info"),
        post(|| async {
            let info = DiskInfo {
                total: 1000,
                free: 400,
                used: 600,
                id: "disk-abc".to_string(),
                ..Default::default()
            };
            rmp_serde::to_vec(&info).unwrap()
        }),
    );
    let disk = fake_peer(app).await;

    let info = disk.disk_info().await.unwrap();
    assert_eq!(info.id, "disk-abc");
    assert_eq!(info.free, 400);

    // Second read comes from the TTL cache.
    let again = disk.disk_info().await.unwrap();
    assert_eq!(again, info);
}

#[tokio::test]
async fn error_bodies_map_through_canonical_set() {
    let app = Router::new().route(
        &route("stat-vol"),
        post(|| async { (StatusCode::NOT_FOUND, "volume not found") }),
    );
    let disk = fake_peer(app).await;

    let err = disk.stat_vol("photos").await.unwrap_err();
    assert_eq!(err, StorageError::VolumeNotFound);
    // A plain protocol error must not take the disk offline.
    assert!(disk.is_online());
}

#[tokio::test]
async fn stale_disk_rejection_reads_as_not_found() {
    let app = Router::new().route(
        &route("make-vol"),
        post(|RawQuery(q): RawQuery| async move {
            // The server rejects a disk-id mismatch with the stale
            // sentinel; the client must collapse it to disk-not-found.
            assert!(q.unwrap_or_default().contains("disk-id="));
            (StatusCode::PRECONDITION_FAILED, "drive is stale")
        }),
    );
    let disk = fake_peer(app).await;
    disk.set_disk_id("expected-id".to_string());

    let err = disk.make_vol("photos").await.unwrap_err();
    assert_eq!(err, StorageError::DiskNotFound);
}

#[tokio::test]
async fn connection_refused_marks_disk_offline() {
    // Point at a port nobody listens on.
    let disk = RemoteDisk::new(Endpoint::new("http", "127.0.0.1:1", "/mnt/disk1"), false);
    let err = disk.read_all("photos", "obj/xl.meta").await.unwrap_err();
    assert_eq!(err, StorageError::DiskNotFound);
    assert!(!disk.is_online());

    // Offline clients short-circuit without touching the network.
    let err = disk.disk_info().await.unwrap_err();
    assert_eq!(err, StorageError::DiskNotFound);
}

#[tokio::test]
async fn delete_versions_scatters_per_slot_errors() {
    let app = Router::new().route(
        &route("delete-versions"),
        post(|| async {
            let mut body = Vec::new();
            frames::push_frame(&mut body, &None::<String>);
            frames::push_frame(
                &mut body,
                &DeleteVersionsResp {
                    errs: vec![None, Some("file version not found".to_string()), None],
                },
            );
            body
        }),
    );
    let disk = fake_peer(app).await;

    let versions = vec![Default::default(); 3];
    let errs = disk.delete_versions("photos", versions).await;
    assert_eq!(errs.len(), 3);
    assert_eq!(errs[0], None);
    assert_eq!(errs[1], Some(StorageError::FileVersionNotFound));
    assert_eq!(errs[2], None);
}

#[tokio::test]
async fn stat_info_file_streams_until_eof() {
    let app = Router::new().route(
        &route("stat-info-file"),
        post(|Query(_q): Query<std::collections::HashMap<String, String>>| async {
            let mut body = Vec::new();
            frames::push_keepalive(&mut body);
            frames::push_frame(&mut body, &None::<String>);
            for i in 0..4i64 {
                frames::push_frame(
                    &mut body,
                    &StatInfo {
                        name: format!("part.{i}"),
                        size: 128 * i,
                        mod_time: 1_700_000_000 + i,
                        dir: false,
                    },
                );
            }
            body
        }),
    );
    let disk = fake_peer(app).await;

    let stats = disk.stat_info_file("photos", "obj/*", true).await.unwrap();
    assert_eq!(stats.len(), 4);
    assert_eq!(stats[3].name, "part.3");
}

#[tokio::test]
async fn ns_scanner_pushes_updates_and_returns_final_cache() {
    let app = Router::new().route(
        &route("ns-scanner"),
        post(|body: axum::body::Bytes| async move {
            // The request body carries the caller's current cache.
            let sent: DataUsageCache = rmp_serde::from_slice(&body).unwrap();
            assert_eq!(sent.generation, 6);

            let mut out = Vec::new();
            frames::push_frame(&mut out, &None::<String>);
            for i in 0..2u64 {
                frames::push_frame(&mut out, &true);
                frames::push_frame(
                    &mut out,
                    &DataUsageEntry {
                        prefix: format!("p{i}/"),
                        objects: i,
                        versions: i,
                        size: 100 * i,
                    },
                );
            }
            frames::push_frame(&mut out, &false);
            frames::push_frame(
                &mut out,
                &DataUsageCache {
                    generation: 7,
                    entries: vec![],
                },
            );
            out
        }),
    );
    let disk = fake_peer(app).await;

    let (tx, mut rx) = mpsc::channel(16);
    let cache = DataUsageCache {
        generation: 6,
        entries: vec![],
    };
    let new_cache = disk.ns_scanner(&cache, 0, tx).await.unwrap();
    assert_eq!(new_cache.generation, 7);

    let mut updates = Vec::new();
    while let Some(u) = rx.recv().await {
        updates.push(u.prefix);
    }
    assert_eq!(updates, vec!["p0/", "p1/"]);
}

#[tokio::test]
async fn create_file_surfaces_streamed_error() {
    let app = Router::new().route(
        &route("create-file"),
        post(|_body: Body| async {
            let mut out = Vec::new();
            frames::push_keepalive(&mut out);
            frames::push_frame(&mut out, &Some("disk path full".to_string()));
            out.into_response()
        }),
    );
    let disk = fake_peer(app).await;

    let data: &[u8] = b"hello world";
    let err = disk
        .create_file("photos", "obj/part.1", data.len() as i64, data)
        .await
        .unwrap_err();
    assert_eq!(err, StorageError::DiskFull);
}
