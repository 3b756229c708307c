//! External collaborators, modeled as traits.
//!
//! The IAM policy engine, the KMS, the DNS federation directory and the
//! bucket metadata/versioning subsystems are out of scope for the core;
//! this module defines exactly the interfaces the core consumes, plus the
//! [`CoreServices`] container threaded through constructors (in place of
//! process globals) and in-memory implementations used by the daemon in
//! single-node mode and by tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use skerry_types::events::EventBus;

use crate::ObjectError;

// ---------------------------------------------------------------------------
// IAM policy engine
// ---------------------------------------------------------------------------

/// S3 action names the core authorizes against.
pub mod action {
    pub const LIST_ALL_MY_BUCKETS: &str = "s3:ListAllMyBuckets";
    pub const LIST_BUCKET: &str = "s3:ListBucket";
    pub const GET_BUCKET_LOCATION: &str = "s3:GetBucketLocation";
    pub const LIST_BUCKET_MULTIPART_UPLOADS: &str = "s3:ListBucketMultipartUploads";
    pub const CREATE_BUCKET: &str = "s3:CreateBucket";
    pub const DELETE_BUCKET: &str = "s3:DeleteBucket";
    pub const FORCE_DELETE_BUCKET: &str = "s3:ForceDeleteBucket";
    pub const PUT_OBJECT: &str = "s3:PutObject";
    pub const PUT_OBJECT_FAN_OUT: &str = "s3:PutObjectFanOut";
    pub const DELETE_OBJECT: &str = "s3:DeleteObject";
    pub const GET_BUCKET_POLICY_STATUS: &str = "s3:GetBucketPolicyStatus";
    pub const PUT_BUCKET_OBJECT_LOCK_CONFIGURATION: &str =
        "s3:PutBucketObjectLockConfiguration";
    pub const GET_BUCKET_OBJECT_LOCK_CONFIGURATION: &str =
        "s3:GetBucketObjectLockConfiguration";
    pub const PUT_BUCKET_VERSIONING: &str = "s3:PutBucketVersioning";
    pub const PUT_BUCKET_TAGGING: &str = "s3:PutBucketTagging";
    pub const GET_BUCKET_TAGGING: &str = "s3:GetBucketTagging";
    pub const BYPASS_GOVERNANCE_RETENTION: &str = "s3:BypassGovernanceRetention";
}

/// An authenticated identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    /// Access key; empty for anonymous requests.
    pub access_key: String,
    /// IAM groups of the identity.
    pub groups: Vec<String>,
    /// Token claims attached to the identity.
    pub claims: BTreeMap<String, String>,
}

impl Credential {
    /// Whether this is the anonymous identity.
    pub fn is_anonymous(&self) -> bool {
        self.access_key.is_empty()
    }
}

/// Authentication failures, surfaced as their S3 counterparts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The access key does not exist.
    #[error("invalid access key id")]
    InvalidAccessKeyId,
    /// The request signature does not match.
    #[error("signature does not match")]
    SignatureDoesNotMatch,
    /// The identity is not permitted to perform the action.
    #[error("access denied")]
    AccessDenied,
}

/// One authorization query.
#[derive(Debug, Clone)]
pub struct AuthArgs<'a> {
    /// Action being performed.
    pub action: &'a str,
    /// Target bucket, empty for service-level actions.
    pub bucket: &'a str,
    /// Target object, empty for bucket-level actions.
    pub object: &'a str,
    /// The identity performing the action.
    pub credential: &'a Credential,
    /// Policy condition values extracted from the request.
    pub conditions: BTreeMap<String, Vec<String>>,
    /// Whether the identity is the deployment owner.
    pub is_owner: bool,
}

/// The IAM policy engine facade.
pub trait PolicyEngine: Send + Sync {
    /// Verify the request credential/signature, returning the identity and
    /// whether it is the owner. `None` authorization means anonymous.
    fn authenticate(&self, authorization: Option<&str>) -> Result<(Credential, bool), AuthError>;

    /// Whether `args.credential` may perform `args.action`.
    fn is_allowed(&self, args: &AuthArgs<'_>) -> bool;

    /// Whether the anonymous identity may perform `args.action` (bucket
    /// policy only).
    fn is_allowed_anonymous(&self, args: &AuthArgs<'_>) -> bool;
}

/// Policy engine that accepts a single static credential and allows it
/// everything. Single-node deployments and tests.
pub struct StaticPolicyEngine {
    access_key: String,
    /// Actions denied per object key, for exercising per-entry auth paths.
    denied: Mutex<Vec<(String, String)>>,
}

impl StaticPolicyEngine {
    /// Engine trusting `access_key` as the owner credential.
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            denied: Mutex::new(Vec::new()),
        }
    }

    /// Deny `action` on `object` even for the owner (test hook).
    pub fn deny(&self, action: &str, object: &str) {
        self.denied
            .lock()
            .expect("deny list poisoned")
            .push((action.to_string(), object.to_string()));
    }
}

impl PolicyEngine for StaticPolicyEngine {
    fn authenticate(&self, authorization: Option<&str>) -> Result<(Credential, bool), AuthError> {
        match authorization {
            None => Ok((Credential::default(), false)),
            Some(h) if h.contains(&self.access_key) => Ok((
                Credential {
                    access_key: self.access_key.clone(),
                    ..Default::default()
                },
                true,
            )),
            Some(_) => Err(AuthError::InvalidAccessKeyId),
        }
    }

    fn is_allowed(&self, args: &AuthArgs<'_>) -> bool {
        if args.credential.is_anonymous() {
            return false;
        }
        let denied = self.denied.lock().expect("deny list poisoned");
        !denied
            .iter()
            .any(|(a, o)| a == args.action && o == args.object)
    }

    fn is_allowed_anonymous(&self, _args: &AuthArgs<'_>) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// KMS
// ---------------------------------------------------------------------------

/// KMS encryption context.
pub type KmsContext = BTreeMap<String, String>;

/// ARN prefix stripped from user-supplied KMS key IDs.
pub const KMS_ARN_PREFIX: &str = "arn:aws:kms:";

/// A generated data key: the plaintext for immediate use and the sealed
/// form for storage in object metadata.
#[derive(Clone)]
pub struct GeneratedKey {
    /// Key ID the data key is sealed under.
    pub key_id: String,
    /// Plaintext data key. Never persisted.
    pub plaintext: Vec<u8>,
    /// Data key sealed under the KEK.
    pub sealed: Vec<u8>,
}

/// KMS failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KmsError {
    /// The key ID is unknown or malformed.
    #[error("invalid KMS key id: {0}")]
    InvalidKeyId(String),
    /// Unsealing failed (wrong KEK or corrupted blob).
    #[error("failed to unseal data key")]
    UnsealFailed,
    /// Backend failure.
    #[error("kms backend: {0}")]
    Backend(String),
}

/// The key-management service facade.
#[async_trait::async_trait]
pub trait Kms: Send + Sync {
    /// Generate a fresh data key sealed under `key_id` (empty selects the
    /// default KEK) with the given context.
    async fn generate_key(
        &self,
        key_id: &str,
        context: &KmsContext,
    ) -> Result<GeneratedKey, KmsError>;

    /// Unseal a data key previously produced by [`Kms::generate_key`].
    async fn decrypt_key(
        &self,
        key_id: &str,
        sealed: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError>;

    /// Seal an existing plaintext data key under `key_id` (key rotation
    /// rewraps with this).
    async fn encrypt_key(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError>;

    /// Default KEK ID used when the request names none.
    fn default_key_id(&self) -> String;
}

// ---------------------------------------------------------------------------
// DNS federation directory
// ---------------------------------------------------------------------------

/// One DNS record for a federated bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    /// Bucket name.
    pub key: String,
    /// Host IPs of the deployment owning the bucket.
    pub hosts: Vec<String>,
    /// Record creation time.
    pub created: DateTime<Utc>,
}

/// DNS directory failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// The directory has no entries.
    #[error("no DNS entries found")]
    NoEntriesFound,
    /// The backend does not implement the directory.
    #[error("DNS backend not implemented")]
    NotImplemented,
    /// The configured domain is missing from the directory.
    #[error("DNS domain missing")]
    DomainMissing,
    /// Backend failure.
    #[error("dns backend: {0}")]
    Backend(String),
}

impl DnsError {
    /// Errors that are ignored when listing (an empty or unconfigured
    /// directory is not a failure).
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            DnsError::NoEntriesFound | DnsError::NotImplemented | DnsError::DomainMissing
        )
    }
}

/// The federation DNS directory facade.
#[async_trait::async_trait]
pub trait DnsStore: Send + Sync {
    /// All bucket records in the directory.
    async fn list(&self) -> Result<HashMap<String, Vec<DnsRecord>>, DnsError>;

    /// Records for one bucket.
    async fn get(&self, bucket: &str) -> Result<Vec<DnsRecord>, DnsError>;

    /// Register (or refresh) the bucket under this deployment's IPs.
    async fn put(&self, bucket: &str) -> Result<(), DnsError>;

    /// Remove the bucket's record.
    async fn delete(&self, bucket: &str) -> Result<(), DnsError>;
}

/// In-memory DNS directory for single-node deployments and tests.
pub struct MemoryDnsStore {
    local_hosts: Vec<String>,
    records: Mutex<HashMap<String, Vec<DnsRecord>>>,
}

impl MemoryDnsStore {
    /// Directory registering buckets under `local_hosts`.
    pub fn new(local_hosts: Vec<String>) -> Self {
        Self {
            local_hosts,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a record owned by another deployment (test hook).
    pub fn seed(&self, bucket: &str, hosts: Vec<String>) {
        self.records.lock().expect("dns records poisoned").insert(
            bucket.to_string(),
            vec![DnsRecord {
                key: bucket.to_string(),
                hosts,
                created: Utc::now(),
            }],
        );
    }
}

#[async_trait::async_trait]
impl DnsStore for MemoryDnsStore {
    async fn list(&self) -> Result<HashMap<String, Vec<DnsRecord>>, DnsError> {
        let records = self.records.lock().expect("dns records poisoned");
        if records.is_empty() {
            return Err(DnsError::NoEntriesFound);
        }
        Ok(records.clone())
    }

    async fn get(&self, bucket: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let records = self.records.lock().expect("dns records poisoned");
        records
            .get(bucket)
            .cloned()
            .ok_or(DnsError::NoEntriesFound)
    }

    async fn put(&self, bucket: &str) -> Result<(), DnsError> {
        self.records.lock().expect("dns records poisoned").insert(
            bucket.to_string(),
            vec![DnsRecord {
                key: bucket.to_string(),
                hosts: self.local_hosts.clone(),
                created: Utc::now(),
            }],
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str) -> Result<(), DnsError> {
        self.records
            .lock()
            .expect("dns records poisoned")
            .remove(bucket);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bucket metadata & versioning
// ---------------------------------------------------------------------------

/// Bucket configuration file names, consumed (not owned) by the core.
pub const OBJECT_LOCK_CONFIG: &str = "object-lock.xml";
pub const BUCKET_TAGGING_CONFIG: &str = "tagging.xml";
pub const BUCKET_REPLICATION_CONFIG: &str = "replication.xml";

/// The bucket metadata subsystem facade.
#[async_trait::async_trait]
pub trait BucketMetadataSys: Send + Sync {
    /// Whether object lock is enabled on the bucket.
    async fn object_lock_enabled(&self, bucket: &str) -> bool;

    /// Whether the bucket has active replication rules.
    async fn replication_enabled(&self, bucket: &str) -> bool;

    /// Raw configuration payload (`object-lock.xml`, `tagging.xml`, …).
    async fn get_config(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectError>;

    /// Store a configuration payload.
    async fn set_config(&self, bucket: &str, name: &str, data: Vec<u8>)
        -> Result<(), ObjectError>;

    /// Delete a configuration payload.
    async fn delete_config(&self, bucket: &str, name: &str) -> Result<(), ObjectError>;

    /// Number of buckets with metadata loaded (soft-limit accounting).
    async fn count(&self) -> usize;
}

/// In-memory bucket metadata store.
#[derive(Default)]
pub struct MemoryBucketMetadata {
    configs: Mutex<HashMap<(String, String), Vec<u8>>>,
    lock_enabled: Mutex<BTreeSet<String>>,
    replicated: Mutex<BTreeSet<String>>,
}

impl MemoryBucketMetadata {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark object lock enabled for `bucket`.
    pub fn enable_lock(&self, bucket: &str) {
        self.lock_enabled
            .lock()
            .expect("lock set poisoned")
            .insert(bucket.to_string());
    }

    /// Mark replication active for `bucket`.
    pub fn enable_replication(&self, bucket: &str) {
        self.replicated
            .lock()
            .expect("replication set poisoned")
            .insert(bucket.to_string());
    }
}

#[async_trait::async_trait]
impl BucketMetadataSys for MemoryBucketMetadata {
    async fn object_lock_enabled(&self, bucket: &str) -> bool {
        self.lock_enabled
            .lock()
            .expect("lock set poisoned")
            .contains(bucket)
    }

    async fn replication_enabled(&self, bucket: &str) -> bool {
        self.replicated
            .lock()
            .expect("replication set poisoned")
            .contains(bucket)
    }

    async fn get_config(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectError> {
        self.configs
            .lock()
            .expect("configs poisoned")
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
            .ok_or(ObjectError::ObjectNotFound {
                bucket: bucket.to_string(),
                object: name.to_string(),
            })
    }

    async fn set_config(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), ObjectError> {
        self.configs
            .lock()
            .expect("configs poisoned")
            .insert((bucket.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn delete_config(&self, bucket: &str, name: &str) -> Result<(), ObjectError> {
        self.configs
            .lock()
            .expect("configs poisoned")
            .remove(&(bucket.to_string(), name.to_string()));
        Ok(())
    }

    async fn count(&self) -> usize {
        let configs = self.configs.lock().expect("configs poisoned");
        configs
            .keys()
            .map(|(b, _)| b.clone())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// The bucket versioning subsystem facade.
pub trait VersioningSys: Send + Sync {
    /// Whether versioning is enabled for the bucket.
    fn enabled(&self, bucket: &str) -> bool;
    /// Whether versioning is suspended for the bucket.
    fn suspended(&self, bucket: &str) -> bool;
    /// Whether versioning applies to this prefix.
    fn prefix_enabled(&self, bucket: &str, prefix: &str) -> bool;
    /// Whether versioning is suspended for this prefix.
    fn prefix_suspended(&self, bucket: &str, prefix: &str) -> bool;
}

/// Static versioning state keyed by bucket.
#[derive(Default)]
pub struct StaticVersioning {
    enabled: Mutex<BTreeSet<String>>,
    suspended: Mutex<BTreeSet<String>>,
}

impl StaticVersioning {
    /// All-unversioned state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable versioning for `bucket`.
    pub fn enable(&self, bucket: &str) {
        self.enabled
            .lock()
            .expect("versioning set poisoned")
            .insert(bucket.to_string());
    }

    /// Suspend versioning for `bucket`.
    pub fn suspend(&self, bucket: &str) {
        self.suspended
            .lock()
            .expect("versioning set poisoned")
            .insert(bucket.to_string());
    }
}

impl VersioningSys for StaticVersioning {
    fn enabled(&self, bucket: &str) -> bool {
        self.enabled
            .lock()
            .expect("versioning set poisoned")
            .contains(bucket)
    }

    fn suspended(&self, bucket: &str) -> bool {
        self.suspended
            .lock()
            .expect("versioning set poisoned")
            .contains(bucket)
    }

    fn prefix_enabled(&self, bucket: &str, _prefix: &str) -> bool {
        self.enabled(bucket)
    }

    fn prefix_suspended(&self, bucket: &str, _prefix: &str) -> bool {
        self.suspended(bucket)
    }
}

// ---------------------------------------------------------------------------
// Replication scheduler
// ---------------------------------------------------------------------------

/// The replication scheduler facade; deletes in `Pending` purge state are
/// handed to it after the response is written.
pub trait ReplicationScheduler: Send + Sync {
    /// Queue a replicated delete for the given object.
    fn schedule_delete(&self, bucket: &str, deleted: &skerry_types::DeletedObject);
}

/// Scheduler that records what it was handed. Single-node deployments
/// (no replication targets) and tests.
#[derive(Default)]
pub struct RecordingReplicationScheduler {
    scheduled: Mutex<Vec<(String, String)>>,
}

impl RecordingReplicationScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(bucket, object)` pairs scheduled so far.
    pub fn scheduled(&self) -> Vec<(String, String)> {
        self.scheduled.lock().expect("scheduled poisoned").clone()
    }
}

impl ReplicationScheduler for RecordingReplicationScheduler {
    fn schedule_delete(&self, bucket: &str, deleted: &skerry_types::DeletedObject) {
        self.scheduled
            .lock()
            .expect("scheduled poisoned")
            .push((bucket.to_string(), deleted.name.clone()));
    }
}

// ---------------------------------------------------------------------------
// Service container
// ---------------------------------------------------------------------------

/// Every process-wide service the core consumes, threaded through
/// constructors. Only the root shutdown token lives outside this container.
#[derive(Clone)]
pub struct CoreServices {
    /// IAM policy engine.
    pub iam: Arc<dyn PolicyEngine>,
    /// KMS, when configured.
    pub kms: Option<Arc<dyn Kms>>,
    /// DNS federation directory, when federated.
    pub dns: Option<Arc<dyn DnsStore>>,
    /// Bucket metadata subsystem.
    pub bucket_meta: Arc<dyn BucketMetadataSys>,
    /// Bucket versioning subsystem.
    pub versioning: Arc<dyn VersioningSys>,
    /// Replication scheduler for pending replicated deletes.
    pub replication: Arc<dyn ReplicationScheduler>,
    /// Domain event bus.
    pub events: EventBus,
    /// IPs this deployment answers on, for federation ownership checks.
    pub local_ips: BTreeSet<String>,
    /// Deployment region reported by get-bucket-location.
    pub region: String,
}

impl CoreServices {
    /// A single-node service set: static owner credential, no KMS, no DNS.
    pub fn single_node(access_key: impl Into<String>) -> Self {
        Self {
            iam: Arc::new(StaticPolicyEngine::new(access_key)),
            kms: None,
            dns: None,
            bucket_meta: Arc::new(MemoryBucketMetadata::new()),
            versioning: Arc::new(StaticVersioning::new()),
            replication: Arc::new(RecordingReplicationScheduler::new()),
            events: EventBus::new(),
            local_ips: BTreeSet::new(),
            region: String::new(),
        }
    }
}
