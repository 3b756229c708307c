//! `skerryd` — the Skerry daemon.
//!
//! Ties the core subsystems together into a running node with an
//! S3-compatible HTTP API: the service container, the object layer, the
//! batch key-rotation engine and the federation reconciler.
//!
//! # Usage
//!
//! ```text
//! skerryd start                    # start with defaults
//! skerryd start -c skerry.toml     # start with a config file
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skerry_batch::{BatchJobRequest, BatchJobsMetrics, CheckpointStore, KeyRotateJob};
use skerry_io::LocalKms;
use skerry_object::memory::MemObjectLayer;
use skerry_object::services::CoreServices;
use skerry_object::ObjectLayer;
use skerry_s3::{S3Server, S3ServerConfig};
use tracing::{error, info, warn};

use config::DaemonConfig;

#[derive(Parser)]
#[command(
    name = "skerryd",
    version,
    about = "Skerry distributed object storage daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node.
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref()).context("loading config")?;
    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start => start(config).await,
    }
}

async fn start(config: DaemonConfig) -> Result<()> {
    let mut services = CoreServices::single_node(&config.s3.access_key);
    services.region = config.s3.region.clone();
    services.local_ips = config.federation.local_ips.iter().cloned().collect();

    if let Some(master_key) = config.kms_master_key()? {
        let default_key_id = config
            .kms
            .default_key_id
            .clone()
            .unwrap_or_else(|| "skerry-default".to_string());
        services.kms = Some(Arc::new(LocalKms::new(master_key, default_key_id)));
        info!("built-in KMS enabled");
    }

    // The erasure-set backend plugs in here once the storage tier is
    // formatted; until then the volatile memory backend serves requests.
    let layer: Arc<dyn ObjectLayer> = MemObjectLayer::new();

    let server = S3Server::new(S3ServerConfig {
        services: services.clone(),
    });
    server.set_object_layer(layer.clone());

    if let Some(dns) = &services.dns {
        match skerry_federation::reconcile(&layer, dns, &services.local_ips).await {
            Ok(report) => info!(
                updated = report.updated.len(),
                conflicts = report.conflicts.len(),
                "federation reconciled"
            ),
            Err(e) => warn!(error = %e, "federation reconciliation failed"),
        }
    }

    spawn_batch_jobs(&config, layer.clone(), services.clone());

    let addr = config.node.s3_listen_addr.clone();
    info!(addr = %addr, "skerryd starting");
    server
        .serve_with_shutdown(&addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving s3 api")
}

/// Scan the jobs directory and run every `*.yaml` rotation job.
fn spawn_batch_jobs(config: &DaemonConfig, layer: Arc<dyn ObjectLayer>, services: CoreServices) {
    let jobs_dir = config.jobs_dir();
    let checkpoint_dir = config.checkpoint_dir();
    let entries = match std::fs::read_dir(&jobs_dir) {
        Ok(entries) => entries,
        Err(_) => return, // no jobs directory, nothing to do
    };

    let metrics = Arc::new(BatchJobsMetrics::new());
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable batch job spec");
                continue;
            }
        };
        let job = match KeyRotateJob::from_yaml(&raw) {
            Ok(job) => job,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid batch job spec");
                continue;
            }
        };

        // Stable job ID from the file name so checkpoints survive
        // restarts.
        let job_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("batch-job")
            .to_string();
        let request = BatchJobRequest {
            id: job_id.clone(),
            started: chrono::Utc::now(),
            job: job.clone(),
        };

        let layer = layer.clone();
        let services = services.clone();
        let store = Arc::new(CheckpointStore::new(checkpoint_dir.clone()));
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = job
                .validate(layer.as_ref(), services.kms.as_ref())
                .await
            {
                error!(job_id = %job_id, error = %e, "batch job rejected");
                return;
            }
            info!(job_id = %job_id, "batch job starting");
            if let Err(e) = job.start(layer, services, &request, store, metrics).await {
                error!(job_id = %job_id, error = %e, "batch job failed");
            }
        });
    }
}
