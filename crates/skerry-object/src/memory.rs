//! In-memory object layer.
//!
//! The volatile reference backend: single-node smoke deployments and
//! tests. Implements the full [`ObjectLayer`] capability set including
//! versioning, delete markers and namespace walks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use md5::Digest as _;
use skerry_types::{DeletedObject, FileInfo, ObjectToDelete, NULL_VERSION_ID};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::lock::{NsLock, NsLockMap};
use crate::{
    BucketInfo, BucketOptions, DeleteBucketOptions, ListMultipartsInfo, MakeBucketOptions,
    ObjectError, ObjectInfo, ObjectLayer, ObjectOptions, PutReader, WalkOptions,
};

#[derive(Clone)]
struct VersionRecord {
    version_id: String,
    data: Vec<u8>,
    metadata: BTreeMap<String, String>,
    mod_time: chrono::DateTime<Utc>,
    etag: String,
    delete_marker: bool,
}

struct BucketRecord {
    info: BucketInfo,
    /// Versions per object, newest last.
    objects: BTreeMap<String, Vec<VersionRecord>>,
}

/// Volatile [`ObjectLayer`] backed by process memory.
pub struct MemObjectLayer {
    buckets: RwLock<BTreeMap<String, BucketRecord>>,
    locks: NsLockMap,
}

impl MemObjectLayer {
    /// Empty layer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: RwLock::new(BTreeMap::new()),
            locks: NsLockMap::new(),
        })
    }

    /// Raw object bytes, for test assertions.
    pub async fn raw_object(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        let buckets = self.buckets.read().await;
        let versions = buckets.get(bucket)?.objects.get(object)?;
        versions
            .iter()
            .rev()
            .find(|v| !v.delete_marker)
            .map(|v| v.data.clone())
    }

    /// Number of live versions of one object, for test assertions.
    pub async fn version_count(&self, bucket: &str, object: &str) -> usize {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|b| b.objects.get(object))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn latest(versions: &[VersionRecord]) -> Option<&VersionRecord> {
        versions.last()
    }

    fn to_info(bucket: &str, name: &str, record: &VersionRecord, num_versions: usize) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            name: name.to_string(),
            version_id: record.version_id.clone(),
            mod_time: Some(record.mod_time),
            size: record.data.len() as i64,
            etag: record.etag.clone(),
            delete_marker: record.delete_marker,
            user_defined: record.metadata.clone(),
            num_versions,
            purge_status: Default::default(),
            transitioned_object: String::new(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectLayer for MemObjectLayer {
    async fn make_bucket(
        &self,
        bucket: &str,
        opts: MakeBucketOptions,
    ) -> Result<(), ObjectError> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(bucket) {
            return Err(ObjectError::BucketExists {
                bucket: bucket.to_string(),
            });
        }
        buckets.insert(
            bucket.to_string(),
            BucketRecord {
                info: BucketInfo {
                    name: bucket.to_string(),
                    created: Utc::now(),
                    object_lock_enabled: opts.lock_enabled,
                },
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_bucket(
        &self,
        bucket: &str,
        opts: DeleteBucketOptions,
    ) -> Result<(), ObjectError> {
        let mut buckets = self.buckets.write().await;
        let record = buckets.get(bucket).ok_or_else(|| ObjectError::BucketNotFound {
            bucket: bucket.to_string(),
        })?;
        if !record.objects.is_empty() && !opts.force {
            return Err(ObjectError::BucketNotEmpty {
                bucket: bucket.to_string(),
            });
        }
        buckets.remove(bucket);
        Ok(())
    }

    async fn get_bucket_info(
        &self,
        bucket: &str,
        _opts: BucketOptions,
    ) -> Result<BucketInfo, ObjectError> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .map(|b| b.info.clone())
            .ok_or_else(|| ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            })
    }

    async fn list_buckets(&self, _opts: BucketOptions) -> Result<Vec<BucketInfo>, ObjectError> {
        let buckets = self.buckets.read().await;
        Ok(buckets.values().map(|b| b.info.clone()).collect())
    }

    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: PutReader<'_>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(|e| ObjectError::Storage(skerry_storage::to_storage_err(&e.to_string())))?;

        let etag = hex::encode(md5::Md5::digest(&buf));
        let record = VersionRecord {
            version_id: if opts.versioned {
                uuid::Uuid::new_v4().to_string()
            } else {
                String::new()
            },
            data: buf,
            metadata: opts.user_defined.clone(),
            mod_time: Utc::now(),
            etag,
            delete_marker: false,
        };

        let mut buckets = self.buckets.write().await;
        let bucket_record =
            buckets
                .get_mut(bucket)
                .ok_or_else(|| ObjectError::BucketNotFound {
                    bucket: bucket.to_string(),
                })?;
        let versions = bucket_record.objects.entry(object.to_string()).or_default();
        if !opts.versioned {
            versions.clear();
        }
        versions.push(record.clone());
        let num_versions = versions.len();

        Ok(Self::to_info(bucket, object, &record, num_versions))
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        src_info: &ObjectInfo,
        _src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError> {
        let mut buckets = self.buckets.write().await;

        if dst_opts.metadata_only && src_bucket == dst_bucket && src_object == dst_object {
            // Metadata-only self-copy: rewrite the metadata record of the
            // addressed version in place.
            let record = buckets
                .get_mut(dst_bucket)
                .ok_or_else(|| ObjectError::BucketNotFound {
                    bucket: dst_bucket.to_string(),
                })?
                .objects
                .get_mut(dst_object)
                .and_then(|versions| {
                    versions.iter_mut().find(|v| {
                        dst_opts.version_id.is_empty() || v.version_id == dst_opts.version_id
                    })
                })
                .ok_or_else(|| ObjectError::ObjectNotFound {
                    bucket: dst_bucket.to_string(),
                    object: dst_object.to_string(),
                })?;
            record.metadata = src_info.user_defined.clone();
            let out = record.clone();
            return Ok(Self::to_info(dst_bucket, dst_object, &out, 1));
        }

        let source = buckets
            .get(src_bucket)
            .and_then(|b| b.objects.get(src_object))
            .and_then(|versions| Self::latest(versions))
            .cloned()
            .ok_or_else(|| ObjectError::ObjectNotFound {
                bucket: src_bucket.to_string(),
                object: src_object.to_string(),
            })?;

        let dst = buckets
            .get_mut(dst_bucket)
            .ok_or_else(|| ObjectError::BucketNotFound {
                bucket: dst_bucket.to_string(),
            })?;
        let versions = dst.objects.entry(dst_object.to_string()).or_default();
        versions.clear();
        versions.push(source.clone());
        Ok(Self::to_info(dst_bucket, dst_object, &source, 1))
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectToDelete>,
        opts: &ObjectOptions,
    ) -> Vec<(DeletedObject, Option<ObjectError>)> {
        let mut buckets = self.buckets.write().await;
        let Some(bucket_record) = buckets.get_mut(bucket) else {
            let err = ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            };
            return objects
                .into_iter()
                .map(|o| {
                    (
                        DeletedObject {
                            name: o.name,
                            ..Default::default()
                        },
                        Some(err.clone()),
                    )
                })
                .collect();
        };

        let versioned = opts.versioned || opts.version_suspended;
        objects
            .into_iter()
            .map(|request| {
                let versions = match bucket_record.objects.get_mut(&request.name) {
                    Some(versions) => versions,
                    None => {
                        return (
                            DeletedObject {
                                name: request.name.clone(),
                                version_id: request.version_id.clone(),
                                ..Default::default()
                            },
                            Some(ObjectError::ObjectNotFound {
                                bucket: bucket.to_string(),
                                object: request.name,
                            }),
                        )
                    }
                };

                if !request.version_id.is_empty() && request.version_id != NULL_VERSION_ID {
                    // Delete one specific version.
                    let before = versions.len();
                    versions.retain(|v| v.version_id != request.version_id);
                    let found = versions.len() < before;
                    if versions.is_empty() {
                        bucket_record.objects.remove(&request.name);
                    }
                    if !found {
                        return (
                            DeletedObject {
                                name: request.name.clone(),
                                version_id: request.version_id.clone(),
                                ..Default::default()
                            },
                            Some(ObjectError::VersionNotFound {
                                bucket: bucket.to_string(),
                                object: request.name,
                                version_id: request.version_id,
                            }),
                        );
                    }
                    return (
                        DeletedObject {
                            name: request.name,
                            version_id: request.version_id,
                            purge_status: request.purge_status,
                            ..Default::default()
                        },
                        None,
                    );
                }

                if versioned {
                    // Latest-version delete on a versioned bucket leaves
                    // a delete marker.
                    let marker_id = uuid::Uuid::new_v4().to_string();
                    versions.push(VersionRecord {
                        version_id: marker_id.clone(),
                        data: Vec::new(),
                        metadata: BTreeMap::new(),
                        mod_time: Utc::now(),
                        etag: String::new(),
                        delete_marker: true,
                    });
                    return (
                        DeletedObject {
                            name: request.name,
                            delete_marker: true,
                            delete_marker_version_id: marker_id,
                            purge_status: request.purge_status,
                            ..Default::default()
                        },
                        None,
                    );
                }

                bucket_record.objects.remove(&request.name);
                (
                    DeletedObject {
                        name: request.name,
                        purge_status: request.purge_status,
                        ..Default::default()
                    },
                    None,
                )
            })
            .collect()
    }

    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError> {
        let buckets = self.buckets.read().await;
        let versions = buckets
            .get(bucket)
            .ok_or_else(|| ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            })?
            .objects
            .get(object)
            .ok_or_else(|| ObjectError::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            })?;

        let record = if opts.version_id.is_empty() || opts.version_id == NULL_VERSION_ID {
            Self::latest(versions)
        } else {
            versions.iter().find(|v| v.version_id == opts.version_id)
        }
        .ok_or_else(|| ObjectError::VersionNotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
            version_id: opts.version_id.clone(),
        })?;

        Ok(Self::to_info(bucket, object, record, versions.len()))
    }

    async fn list_multipart_uploads(
        &self,
        _bucket: &str,
        prefix: &str,
        key_marker: &str,
        _upload_id_marker: &str,
        _delimiter: &str,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo, ObjectError> {
        // Multipart state lives in the upload subsystem; the memory
        // backend reports none in flight.
        Ok(ListMultipartsInfo {
            uploads: Vec::new(),
            prefix: prefix.to_string(),
            key_marker: key_marker.to_string(),
            is_truncated: false,
            max_uploads,
        })
    }

    async fn walk(
        &self,
        bucket: &str,
        prefix: &str,
        sink: mpsc::Sender<ObjectInfo>,
        opts: WalkOptions,
    ) -> Result<(), ObjectError> {
        let snapshot: Vec<(String, VersionRecord, usize)> = {
            let buckets = self.buckets.read().await;
            let record = buckets.get(bucket).ok_or_else(|| ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
            record
                .objects
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .filter(|(name, _)| opts.marker.is_empty() || name.as_str() >= opts.marker.as_str())
                .filter_map(|(name, versions)| {
                    Self::latest(versions).map(|v| (name.clone(), v.clone(), versions.len()))
                })
                .collect()
        };

        for (name, record, num_versions) in snapshot {
            if let Some(filter) = &opts.filter {
                let fi = FileInfo {
                    volume: bucket.to_string(),
                    name: name.clone(),
                    version_id: record.version_id.clone(),
                    delete_marker: record.delete_marker,
                    mod_time: Some(record.mod_time),
                    size: record.data.len() as i64,
                    metadata: record.metadata.clone(),
                    ..Default::default()
                };
                if !filter(&fi) {
                    continue;
                }
            }
            let info = Self::to_info(bucket, &name, &record, num_versions);
            if sink.send(info).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn new_ns_lock(&self, bucket: &str, object: &str) -> NsLock {
        self.locks.lock_for(bucket, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_walk_roundtrip() {
        let layer = MemObjectLayer::new();
        layer
            .make_bucket("photos", MakeBucketOptions::default())
            .await
            .unwrap();

        let mut data: &[u8] = b"cat picture";
        let info = layer
            .put_object("photos", "2024/cat.jpg", &mut data, &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(info.size, 11);

        let fetched = layer
            .get_object_info("photos", "2024/cat.jpg", &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched.etag, info.etag);

        let (tx, mut rx) = mpsc::channel(8);
        layer
            .walk("photos", "2024/", tx, WalkOptions::default())
            .await
            .unwrap();
        let walked = rx.recv().await.unwrap();
        assert_eq!(walked.name, "2024/cat.jpg");
    }

    #[tokio::test]
    async fn versioned_delete_leaves_marker() {
        let layer = MemObjectLayer::new();
        layer
            .make_bucket("docs", MakeBucketOptions::default())
            .await
            .unwrap();
        let opts = ObjectOptions {
            versioned: true,
            ..Default::default()
        };
        let mut data: &[u8] = b"v1";
        layer.put_object("docs", "a.txt", &mut data, &opts).await.unwrap();

        let results = layer
            .delete_objects(
                "docs",
                vec![ObjectToDelete {
                    name: "a.txt".into(),
                    ..Default::default()
                }],
                &opts,
            )
            .await;
        assert_eq!(results.len(), 1);
        let (deleted, err) = &results[0];
        assert!(err.is_none());
        assert!(deleted.delete_marker);
        assert!(!deleted.delete_marker_version_id.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_object_reports_not_found() {
        let layer = MemObjectLayer::new();
        layer
            .make_bucket("b", MakeBucketOptions::default())
            .await
            .unwrap();
        let results = layer
            .delete_objects(
                "b",
                vec![ObjectToDelete {
                    name: "ghost".into(),
                    ..Default::default()
                }],
                &ObjectOptions::default(),
            )
            .await;
        assert!(results[0].1.as_ref().unwrap().is_not_found());
    }
}
