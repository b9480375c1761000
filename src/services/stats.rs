// src/services/stats.rs
// Pipeline statistics with serialization traits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::types::WorkerStats;

/// Run summary for logging and the optional stats file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineStats {
    pub run_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub records_read: usize,
    pub results_written: usize,
    pub records_flushed: usize,
    pub batches_flushed: usize,
    pub partial_batches: usize,
    pub workers_completed: usize,
    pub worker_failures: usize,
    pub inference_time_ms: u64,
    pub total_time_ms: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            run_timestamp: Utc::now(),
            records_read: 0,
            results_written: 0,
            records_flushed: 0,
            batches_flushed: 0,
            partial_batches: 0,
            workers_completed: 0,
            worker_failures: 0,
            inference_time_ms: 0,
            total_time_ms: 0,
        }
    }

    pub fn add_worker(&mut self, worker: &WorkerStats) {
        self.records_flushed += worker.records;
        self.batches_flushed += worker.batches;
        self.partial_batches += worker.partial_batches;
        self.workers_completed += 1;
        self.inference_time_ms += worker.inference_time.as_millis() as u64;
    }

    pub fn average_batch_size(&self) -> f64 {
        if self.batches_flushed == 0 {
            return 0.0;
        }

        self.records_flushed as f64 / self.batches_flushed as f64
    }

    /// True when every record read produced exactly one written result
    pub fn is_complete(&self) -> bool {
        self.worker_failures == 0
            && self.records_read == self.records_flushed
            && self.records_flushed == self.results_written
    }
}
