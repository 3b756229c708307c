//! Batch job metrics registry.
//!
//! Holds the latest [`BatchJobInfo`] snapshot per job ID (weak keys: a
//! snapshot, not an owning reference to the job) and times individual
//! rotation attempts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use crate::checkpoint::BatchJobInfo;

/// Registry of in-flight and recently finished batch jobs.
#[derive(Default)]
pub struct BatchJobsMetrics {
    snapshots: Mutex<HashMap<String, BatchJobInfo>>,
}

impl BatchJobsMetrics {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest progress snapshot for a job.
    pub fn save(&self, job_id: &str, info: &BatchJobInfo) {
        self.snapshots
            .lock()
            .expect("metrics snapshots poisoned")
            .insert(job_id.to_string(), info.clone());
    }

    /// Latest snapshot for a job, if any.
    pub fn get(&self, job_id: &str) -> Option<BatchJobInfo> {
        self.snapshots
            .lock()
            .expect("metrics snapshots poisoned")
            .get(job_id)
            .cloned()
    }

    /// Open a trace for one rotation attempt. Finish it with
    /// [`AttemptTrace::done`].
    pub fn trace(&self, job_id: &str, attempt: usize, object: &str) -> AttemptTrace {
        AttemptTrace {
            job_id: job_id.to_string(),
            object: object.to_string(),
            attempt,
            started: Instant::now(),
        }
    }
}

/// Timing handle for one rotation attempt.
pub struct AttemptTrace {
    job_id: String,
    object: String,
    attempt: usize,
    started: Instant,
}

impl AttemptTrace {
    /// Record the outcome of the attempt.
    pub fn done(self, error: Option<&dyn std::fmt::Display>) {
        let elapsed = self.started.elapsed();
        match error {
            None => debug!(
                job_id = %self.job_id,
                object = %self.object,
                attempt = self.attempt,
                ?elapsed,
                "rotation attempt succeeded"
            ),
            Some(e) => warn!(
                job_id = %self.job_id,
                object = %self.object,
                attempt = self.attempt,
                ?elapsed,
                error = %e,
                "rotation attempt failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_keyed_by_job() {
        let metrics = BatchJobsMetrics::new();
        let mut info = BatchJobInfo::new("job-1", "keyrotate");
        info.objects = 3;
        metrics.save("job-1", &info);

        assert_eq!(metrics.get("job-1").unwrap().objects, 3);
        assert!(metrics.get("job-2").is_none());

        info.objects = 4;
        metrics.save("job-1", &info);
        assert_eq!(metrics.get("job-1").unwrap().objects, 4);
    }
}
