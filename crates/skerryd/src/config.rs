//! TOML configuration for the Skerry daemon.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node identity and addresses.
    pub node: NodeSection,
    /// S3 API settings.
    pub s3: S3Section,
    /// Key management settings.
    pub kms: KmsSection,
    /// Federation settings.
    pub federation: FederationSection,
    /// Batch engine settings.
    pub batch: BatchSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (batch checkpoints, job specs).
    pub data_dir: PathBuf,
    /// Address for the S3 HTTP API.
    pub s3_listen_addr: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".skerry"))
            .unwrap_or_else(|| PathBuf::from(".skerry"));
        Self {
            data_dir,
            s3_listen_addr: "0.0.0.0:9310".to_string(),
        }
    }
}

/// `[s3]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct S3Section {
    /// Owner access key.
    pub access_key: String,
    /// Region reported by get-bucket-location; empty means the default
    /// region (serialized as an empty location).
    pub region: String,
}

impl Default for S3Section {
    fn default() -> Self {
        Self {
            access_key: "skerryadmin".to_string(),
            region: String::new(),
        }
    }
}

/// `[kms]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KmsSection {
    /// Hex-encoded 32-byte master key for the built-in KMS. Unset
    /// disables server-side encryption.
    pub master_key: Option<String>,
    /// Default KEK ID.
    pub default_key_id: Option<String>,
}

/// `[federation]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FederationSection {
    /// IPs this deployment answers on, for ownership checks.
    pub local_ips: Vec<String>,
}

/// `[batch]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// Directory scanned for `*.yaml` job definitions at startup.
    /// Defaults to `<data_dir>/batch-jobs`.
    pub jobs_dir: Option<PathBuf>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Effective batch jobs directory.
    pub fn jobs_dir(&self) -> PathBuf {
        self.batch
            .jobs_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("batch-jobs"))
    }

    /// Effective checkpoint directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.node.data_dir.join("batch-checkpoints")
    }

    /// Decode the KMS master key, if configured.
    pub fn kms_master_key(&self) -> anyhow::Result<Option<[u8; 32]>> {
        match &self.kms.master_key {
            None => Ok(None),
            Some(raw) => {
                let bytes = hex::decode(raw)?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("kms master key must be 32 bytes"))?;
                Ok(Some(key))
            }
        }
    }
}
