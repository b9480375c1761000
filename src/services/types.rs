// src/services/types.rs
use std::time::Duration;

pub type FeatureVector = Vec<f64>;

/// One parsed input row
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub entity_key: String,
    pub vector: FeatureVector,
}

impl Record {
    pub fn new(entity_key: impl Into<String>, vector: FeatureVector) -> Self {
        Self {
            entity_key: entity_key.into(),
            vector,
        }
    }

    pub fn width(&self) -> usize {
        self.vector.len()
    }
}

/// One scored record, correlated back to its input row by entity key
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceResult {
    pub entity_key: String,
    pub value: f64,
}

/// Per-worker counters returned when a worker reaches Done
#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub records: usize,
    pub batches: usize,
    pub partial_batches: usize,
    pub inference_time: Duration,
}
