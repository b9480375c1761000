// src/services/config.rs

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::services::error::ConfigError;

pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_WORKERS: usize = 1;
pub const RESULT_FLUSH_EVERY: usize = 1000; // rows buffered before the sink flushes
pub const PROGRESS_INTERVAL_SECS: u64 = 10;
pub const DIAL_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_INPUT_TENSOR: &str = "input-0";

/// What a lookup returns when a known feature has no entry for the raw value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum UnmappedPolicy {
    /// Unmapped categorical values resolve to 0.0
    #[default]
    Zero,
    /// Unmapped values are parsed as numbers like cells of unmapped features
    ParseRaw,
}

/// How the driver reacts to a failed stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// The first failure aborts every task and is returned
    #[default]
    AbortRun,
    /// A failed worker is logged and its siblings keep going; failures are reported at the end
    IsolateWorker,
}

/// Everything the pipeline needs, resolved once at start-up
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub host: String,
    pub model_name: String,
    pub worker_count: usize,
    pub batch_size: usize,
    pub mapping_dir: Option<PathBuf>,
    pub has_headers: bool,
    pub unmapped: UnmappedPolicy,
    /// Reject cells that are parsed directly and are not numbers, instead of using 0.0
    pub strict_cells: bool,
    pub failure_policy: FailurePolicy,
    pub flush_every: usize,
    pub input_tensor: String,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub check_ready: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            output_path: PathBuf::new(),
            host: String::new(),
            model_name: String::new(),
            worker_count: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            mapping_dir: None,
            has_headers: false,
            unmapped: UnmappedPolicy::Zero,
            strict_cells: false,
            failure_policy: FailurePolicy::AbortRun,
            flush_every: RESULT_FLUSH_EVERY,
            input_tensor: DEFAULT_INPUT_TENSOR.to_string(),
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            check_ready: true,
        }
    }
}

impl PipelineConfig {
    /// Checks the settings that would otherwise fail halfway through a run.
    ///
    /// The input file must exist; the output file is created by the sink.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker count must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".into()));
        }
        if self.flush_every == 0 {
            return Err(ConfigError::Invalid("flush cadence must be at least 1".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("inference host is empty".into()));
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("model name is empty".into()));
        }
        if self.mapping_dir.is_some() && !self.has_headers {
            return Err(ConfigError::Invalid(
                "a mapping directory needs an input header naming each column".into(),
            ));
        }
        if !self.input_path.is_file() {
            return Err(ConfigError::MissingInput(self.input_path.clone()));
        }
        Ok(())
    }
}
