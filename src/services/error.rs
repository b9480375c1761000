// src/services/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),
}

/// Failures while loading or querying the feature mapping tables
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to read mapping directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read mapping file {}: {source}", path.display())]
    ReadFile { path: PathBuf, source: csv::Error },

    #[error("{}:{line}: expected 2 columns, found {columns}", path.display())]
    MalformedRow {
        path: PathBuf,
        line: u64,
        columns: usize,
    },

    #[error("{}:{line}: mapped value {value:?} is not a number", path.display())]
    BadValue {
        path: PathBuf,
        line: u64,
        value: String,
    },

    #[error("feature {feature:?}: value {value:?} is not numeric")]
    NotNumeric { feature: String, value: String },
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("record {entity_key:?} has width {found}, batch width is {expected}")]
    WidthMismatch {
        entity_key: String,
        expected: usize,
        found: usize,
    },
}

/// Failures talking to the inference server
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid inference host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("inference server at {0} is not ready")]
    NotReady(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("inference server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference response carried no output tensors")]
    EmptyResponse,

    #[error("inference returned {got} results for {expected} records")]
    ResultCount { expected: usize, got: usize },
}

/// Umbrella error returned by every pipeline stage
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("input row {line}: {source}")]
    Input { line: u64, source: csv::Error },

    #[error("failed to write results: {0}")]
    Output(#[from] csv::Error),

    #[error("failed to flush results: {0}")]
    Flush(#[from] std::io::Error),

    #[error("request queue closed before the source finished")]
    RequestQueueClosed,

    #[error("result queue closed while worker was emitting results")]
    ResultQueueClosed,

    #[error("worker {worker_id} failed: {source}")]
    Worker {
        worker_id: usize,
        source: Box<PipelineError>,
    },

    #[error("{count} worker(s) failed, first: {first}")]
    WorkersFailed {
        count: usize,
        first: Box<PipelineError>,
    },

    #[error("pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// True for errors that only report another stage going away
    pub fn is_queue_closed(&self) -> bool {
        match self {
            PipelineError::RequestQueueClosed | PipelineError::ResultQueueClosed => true,
            PipelineError::Worker { source, .. } => source.is_queue_closed(),
            _ => false,
        }
    }
}
