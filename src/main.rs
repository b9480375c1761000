// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use batch_inference_lib::services::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_INPUT_TENSOR, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_WORKERS,
    DIAL_TIMEOUT_SECS, RESULT_FLUSH_EVERY,
};
use batch_inference_lib::{BatchPipeline, FailurePolicy, HttpDialer, PipelineConfig, UnmappedPolicy};

/// Batch inference against a KServe v2 model server
#[derive(Parser, Debug)]
#[command(name = "batch-inference", version, about)]
struct Args {
    /// Input file; first column is the entity key, the rest are features
    #[arg(short = 'i', long = "input", env = "BATCH_INPUT")]
    input: PathBuf,

    /// Output file receiving `entity_key,value` rows
    #[arg(short = 'o', long = "output", env = "BATCH_OUTPUT")]
    output: PathBuf,

    /// Inference server, as host:port or a full URL
    #[arg(long, env = "INFERENCE_HOST")]
    host: String,

    /// Model name on the server
    #[arg(short = 'm', long = "model", env = "MODEL_NAME")]
    model: String,

    /// Number of parallel request workers
    #[arg(short = 'w', long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Records per inference request
    #[arg(short = 'b', long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Directory of `<feature>.csv` value mappings
    #[arg(long, env = "MAPPING_DIR")]
    mapping_dir: Option<PathBuf>,

    /// The input starts with a header row naming each column
    #[arg(long)]
    has_header: bool,

    /// Value used for categorical values missing from their mapping
    #[arg(long, value_enum, default_value_t = UnmappedPolicy::Zero)]
    unmapped: UnmappedPolicy,

    /// Fail on cells that are not numbers instead of reading them as 0
    #[arg(long)]
    strict_cells: bool,

    /// What a failing worker does to the rest of the run
    #[arg(long, value_enum, default_value_t = FailurePolicy::AbortRun)]
    failure_policy: FailurePolicy,

    /// Rows buffered before the output is flushed
    #[arg(long, default_value_t = RESULT_FLUSH_EVERY)]
    flush_every: usize,

    /// Name of the request tensor
    #[arg(long, default_value = DEFAULT_INPUT_TENSOR)]
    input_tensor: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// Do not probe /v2/health/ready before starting
    #[arg(long)]
    skip_ready_check: bool,

    /// Write the final run statistics as JSON to this file
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        let has_headers = self.has_header || self.mapping_dir.is_some();
        PipelineConfig {
            input_path: self.input,
            output_path: self.output,
            host: self.host,
            model_name: self.model,
            worker_count: self.workers,
            batch_size: self.batch_size,
            mapping_dir: self.mapping_dir,
            has_headers,
            unmapped: self.unmapped,
            strict_cells: self.strict_cells,
            failure_policy: self.failure_policy,
            flush_every: self.flush_every,
            input_tensor: self.input_tensor,
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            check_ready: !self.skip_ready_check,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Try to load .env file if it exists, before clap reads env fallbacks
    let env_paths = [".env", ".env.local", "../.env"];
    let mut loaded_env = false;

    for path in env_paths.iter() {
        if Path::new(path).exists() {
            if let Err(e) = dotenv::from_filename(path) {
                warn!("Failed to load environment from {}: {}", path, e);
            } else {
                info!("Loaded environment variables from {}", path);
                loaded_env = true;
                break;
            }
        }
    }

    if !loaded_env {
        info!("No .env file found, using environment variables from system");
    }

    let args = Args::parse();
    let stats_path = args.stats_json.clone();
    let config = args.into_config();
    config.validate().context("Invalid configuration")?;

    let dialer = HttpDialer::new(config.dial_timeout, config.request_timeout)
        .with_input_tensor(config.input_tensor.clone())
        .with_readiness_check(config.check_ready);

    info!(
        "Starting batch inference: {} -> {}",
        config.input_path.display(),
        config.output_path.display()
    );
    let pipeline =
        BatchPipeline::from_config(config, dialer).context("Failed to load feature mappings")?;
    let stats = pipeline
        .run_files()
        .await
        .context("Batch inference failed")?;

    if let Some(path) = stats_path {
        let json = serde_json::to_string_pretty(&stats).context("Failed to encode run stats")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run stats to {}", path.display()))?;
        info!("Run stats written to {}", path.display());
    }

    info!(
        "Successfully scored {} records in {}ms",
        stats.results_written, stats.total_time_ms
    );

    Ok(())
}
