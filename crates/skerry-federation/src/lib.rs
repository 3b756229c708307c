//! DNS federation reconciler.
//!
//! On startup (and on bucket listing of a federated deployment) the local
//! bucket set is diffed against the DNS directory:
//!
//! - local bucket, record matches our IPs exactly — nothing to do;
//! - local bucket, record overlaps partially or is missing — register
//!   (`dns.put`), 50 writes in flight at a time; any failure aborts the
//!   pass;
//! - local bucket, record held by foreign IPs — a global-uniqueness
//!   conflict: logged and left for the operator;
//! - record only in DNS but pointing at us — stale, deleted;
//! - record only in DNS pointing elsewhere — another tenant's bucket.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use skerry_object::services::{DnsError, DnsStore};
use skerry_object::{BucketOptions, ObjectError, ObjectLayer};
use tracing::{error, info, warn};

/// Concurrent `dns.put` calls during a reconciliation pass.
const PUT_CONCURRENCY: usize = 50;

/// Reconciliation failures.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// Listing local buckets failed.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// A directory write failed; the pass is aborted.
    #[error(transparent)]
    Dns(#[from] DnsError),
}

/// What a reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FederationReport {
    /// Buckets registered or refreshed in the directory.
    pub updated: Vec<String>,
    /// Buckets whose records belong to a foreign deployment.
    pub conflicts: Vec<String>,
    /// Stale records removed from the directory.
    pub deleted_stale: Vec<String>,
}

/// Align the local bucket set with the DNS directory.
pub async fn reconcile(
    layer: &Arc<dyn ObjectLayer>,
    dns: &Arc<dyn DnsStore>,
    local_ips: &BTreeSet<String>,
) -> Result<FederationReport, FederationError> {
    let buckets = layer.list_buckets(BucketOptions::default()).await?;
    if buckets.is_empty() {
        return Ok(FederationReport::default());
    }

    let dns_records = match dns.list().await {
        Ok(records) => records,
        Err(e) if e.is_ignorable() => Default::default(),
        Err(e) => {
            error!(error = %e, "failed to list federation records");
            return Err(e.into());
        }
    };

    let local: BTreeSet<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
    let mut report = FederationReport::default();
    let mut to_update = Vec::new();

    for bucket in &buckets {
        match dns_records.get(&bucket.name) {
            None => to_update.push(bucket.name.clone()),
            Some(records) => {
                let hosts: BTreeSet<&str> = records
                    .iter()
                    .flat_map(|r| r.hosts.iter().map(String::as_str))
                    .collect();
                let intersects = hosts.iter().any(|h| local_ips.contains(*h));
                let exact = intersects && hosts.iter().all(|h| local_ips.contains(*h));
                if exact {
                    // Record already matches this deployment.
                    continue;
                }
                if intersects {
                    // Partial overlap: the record predates an IP change.
                    to_update.push(bucket.name.clone());
                    continue;
                }
                // Bucket names are globally unique in a federation; a
                // record under foreign IPs needs operator intervention.
                warn!(
                    bucket = %bucket.name,
                    "bucket exists under a different tenant in the federation; ignoring local copy"
                );
                report.conflicts.push(bucket.name.clone());
            }
        }
    }

    // Register missing/outdated records, 50 in flight. Any failure
    // aborts the pass; the next pass retries everything.
    let mut pending = FuturesUnordered::new();
    let mut queue = to_update.iter();
    loop {
        while pending.len() < PUT_CONCURRENCY {
            match queue.next() {
                Some(bucket) => pending.push(async move {
                    dns.put(bucket).await.map(|()| bucket.clone())
                }),
                None => break,
            }
        }
        match pending.next().await {
            Some(Ok(bucket)) => report.updated.push(bucket),
            Some(Err(e)) => {
                error!(error = %e, "federation record write failed; aborting pass");
                return Err(e.into());
            }
            None => break,
        }
    }

    // Remove stale records: registered to us, but the bucket is gone.
    for (name, records) in &dns_records {
        if local.contains(name.as_str()) {
            continue;
        }
        let points_to_us = records
            .iter()
            .flat_map(|r| r.hosts.iter())
            .any(|h| local_ips.contains(h));
        if !points_to_us {
            continue;
        }
        match dns.delete(name).await {
            Ok(()) => report.deleted_stale.push(name.clone()),
            Err(e) => {
                warn!(bucket = %name, error = %e, "failed to remove stale federation record");
            }
        }
    }

    info!(
        updated = report.updated.len(),
        conflicts = report.conflicts.len(),
        stale = report.deleted_stale.len(),
        "federation reconciliation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skerry_object::memory::MemObjectLayer;
    use skerry_object::services::MemoryDnsStore;
    use skerry_object::MakeBucketOptions;

    fn ips(hosts: &[&str]) -> BTreeSet<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    async fn layer_with(buckets: &[&str]) -> Arc<dyn ObjectLayer> {
        let layer = MemObjectLayer::new();
        for bucket in buckets {
            layer
                .make_bucket(bucket, MakeBucketOptions::default())
                .await
                .unwrap();
        }
        layer
    }

    #[tokio::test]
    async fn registers_missing_buckets() {
        let layer = layer_with(&["a", "b"]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1"])).await.unwrap();
        let mut updated = report.updated.clone();
        updated.sort();
        assert_eq!(updated, vec!["a", "b"]);
        assert!(dns.get("a").await.is_ok());
        assert!(dns.get("b").await.is_ok());
    }

    #[tokio::test]
    async fn exact_matches_are_untouched() {
        let layer = layer_with(&["a"]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
        dns.seed("a", vec!["10.0.0.1".to_string()]);
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1"])).await.unwrap();
        assert!(report.updated.is_empty());
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn partial_overlap_refreshes_the_record() {
        let layer = layer_with(&["a"]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec![
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
        ]));
        // The record carries one of our IPs plus a long-gone one.
        dns.seed("a", vec!["10.0.0.1".to_string(), "10.9.9.9".to_string()]);
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1", "10.0.0.2"]))
            .await
            .unwrap();
        assert_eq!(report.updated, vec!["a"]);
        let records = dns.get("a").await.unwrap();
        assert_eq!(records[0].hosts, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn foreign_records_conflict_and_stay() {
        let layer = layer_with(&["b"]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
        dns.seed("b", vec!["172.16.0.8".to_string(), "172.16.0.9".to_string()]);
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1"])).await.unwrap();
        assert_eq!(report.conflicts, vec!["b"]);
        assert!(report.updated.is_empty());

        // The foreign record is untouched and the local bucket remains.
        let records = dns.get("b").await.unwrap();
        assert_eq!(records[0].hosts[0], "172.16.0.8");
        assert_eq!(
            layer.list_buckets(BucketOptions::default()).await.unwrap()[0].name,
            "b"
        );
    }

    #[tokio::test]
    async fn stale_records_pointing_at_us_are_deleted() {
        let layer = layer_with(&["kept"]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
        dns.seed("gone", vec!["10.0.0.1".to_string()]);
        dns.seed("other-tenant", vec!["172.16.0.8".to_string()]);
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1"])).await.unwrap();
        assert_eq!(report.deleted_stale, vec!["gone"]);
        assert!(dns.get("gone").await.is_err());
        // Another tenant's record is none of our business.
        assert!(dns.get("other-tenant").await.is_ok());
    }

    #[tokio::test]
    async fn empty_local_set_is_a_no_op() {
        let layer = layer_with(&[]).await;
        let dns = Arc::new(MemoryDnsStore::new(vec!["10.0.0.1".to_string()]));
        dns.seed("gone", vec!["10.0.0.1".to_string()]);
        let dns_dyn: Arc<dyn DnsStore> = dns.clone();

        let report = reconcile(&layer, &dns_dyn, &ips(&["10.0.0.1"])).await.unwrap();
        assert_eq!(report, FederationReport::default());
        // Without local buckets the pass does not touch the directory.
        assert!(dns.get("gone").await.is_ok());
    }
}
