// src/services/pipeline.rs

use log::{debug, error, info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::services::config::{FailurePolicy, PipelineConfig, PROGRESS_INTERVAL_SECS};
use crate::services::connection::{ConnectionCache, Dialer};
use crate::services::data_fetcher::RecordSource;
use crate::services::data_writer::ResultWriter;
use crate::services::error::PipelineError;
use crate::services::mapping::FeatureMapping;
use crate::services::shutdown::ShutdownSignal;
use crate::services::stats::PipelineStats;
use crate::services::types::WorkerStats;
use crate::services::worker::InferenceWorker;

/// Source → workers → sink, wired together for one run
///
/// The dialer is handed in so tests can run the whole pipeline against a fake.
pub struct BatchPipeline<D> {
    config: PipelineConfig,
    mapping: Arc<FeatureMapping>,
    connections: Arc<ConnectionCache<D>>,
}

impl<D: Dialer + 'static> BatchPipeline<D> {
    /// Wires a pipeline around an already loaded mapping.
    ///
    /// The unmapped-value policy and the strict-cell setting of `config`
    /// replace whatever the mapping was built with.
    pub fn new(config: PipelineConfig, mapping: FeatureMapping, dialer: D) -> Self {
        let mapping = mapping
            .with_policy(config.unmapped)
            .with_strict_cells(config.strict_cells);
        Self {
            config,
            mapping: Arc::new(mapping),
            connections: Arc::new(ConnectionCache::new(dialer)),
        }
    }

    /// Loads the tables in `config.mapping_dir` (none without one) and wires the pipeline
    pub fn from_config(config: PipelineConfig, dialer: D) -> Result<Self, PipelineError> {
        let mapping = match &config.mapping_dir {
            Some(dir) => FeatureMapping::load(dir)?,
            None => FeatureMapping::empty(),
        };
        Ok(Self::new(config, mapping, dialer))
    }

    /// Runs the pipeline from `config.input_path` to `config.output_path`.
    pub async fn run_files(&self) -> Result<PipelineStats, PipelineError> {
        self.config.validate()?;

        let input = File::open(&self.config.input_path).map_err(|source| PipelineError::Open {
            path: self.config.input_path.clone(),
            source,
        })?;
        let output =
            File::create(&self.config.output_path).map_err(|source| PipelineError::Open {
                path: self.config.output_path.clone(),
                source,
            })?;

        self.run(BufReader::new(input), BufWriter::new(output)).await
    }

    /// Runs the pipeline over arbitrary input and output streams.
    ///
    /// # Arguments
    /// * `input` - Comma-delimited rows, read on a blocking thread
    /// * `output` - Destination of `entity_key,value` rows, written on a blocking thread
    ///
    /// # Returns
    /// * `Result<PipelineStats, PipelineError>` - Run counters, or the failure
    ///   selected by the configured failure policy
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<PipelineStats, PipelineError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let start = Instant::now();
        let mut stats = PipelineStats::new();
        let workers = self.config.worker_count.max(1);

        info!(
            "Run {}: {} workers, batch size {}, model {} at {}",
            stats.run_id, workers, self.config.batch_size, self.config.model_name, self.config.host
        );
        debug!(
            "Feature mapping: {} tables, unmapped values {:?}, strict cells {}",
            self.mapping.len(),
            self.mapping.unmapped_policy(),
            self.mapping.strict_cells()
        );

        // every worker dials (or reuses) its connection before any record moves
        let mut connections = Vec::with_capacity(workers);
        for _ in 0..workers {
            connections.push(self.connections.get_connection(&self.config.host).await?);
        }

        let (request_tx, request_rx) = mpsc::channel(workers);
        let (result_tx, result_rx) = mpsc::channel(workers);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let (shutdown, listener) = ShutdownSignal::new();
        let active_workers = Arc::new(AtomicUsize::new(0));
        let model_name: Arc<str> = Arc::from(self.config.model_name.as_str());

        let flush_every = self.config.flush_every;
        let sink = tokio::task::spawn_blocking(move || {
            let mut writer = ResultWriter::new(
                output,
                flush_every,
                Duration::from_secs(PROGRESS_INTERVAL_SECS),
            );
            let written = writer.consume(result_rx)?;
            writer.into_inner()?;
            Ok::<usize, PipelineError>(written)
        });

        let mut pool = JoinSet::new();
        for (id, connection) in connections.into_iter().enumerate() {
            let worker = InferenceWorker::new(
                id,
                connection,
                model_name.clone(),
                self.config.batch_size,
                request_rx.clone(),
                result_tx.clone(),
                listener.clone(),
                active_workers.clone(),
            );
            pool.spawn(worker.run());
        }
        // only workers hold the queues from here on
        drop(result_tx);
        drop(request_rx);
        drop(listener);

        let mapping = self.mapping.clone();
        let has_headers = self.config.has_headers;
        let mut source = tokio::task::spawn_blocking(move || {
            RecordSource::new(input, mapping, has_headers).run(request_tx, shutdown)
        });

        let mut errors: Vec<PipelineError> = Vec::new();
        let mut worker_failures = Vec::new();
        let mut source_done = false;

        loop {
            tokio::select! {
                joined = &mut source, if !source_done => {
                    source_done = true;
                    match flatten(joined) {
                        Ok(records) => stats.records_read = records,
                        Err(e) => {
                            error!("Record source failed: {}", e);
                            pool.abort_all();
                            errors.push(e);
                        }
                    }
                }
                joined = pool.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(joined) => match flatten(joined) {
                        Ok(worker) => self.record_worker(&mut stats, &worker),
                        Err(e) => {
                            error!("{}", e);
                            stats.worker_failures += 1;
                            match self.config.failure_policy {
                                FailurePolicy::AbortRun => {
                                    pool.abort_all();
                                    errors.push(e);
                                }
                                FailurePolicy::IsolateWorker => {
                                    warn!("Isolating failed worker, {} still running", pool.len());
                                    worker_failures.push(e);
                                }
                            }
                        }
                    },
                },
            }
        }

        // workers are gone, so a source still blocked on the queue sees it closed
        if !source_done {
            match flatten(source.await) {
                Ok(records) => stats.records_read = records,
                Err(e) => {
                    debug!("Record source stopped after the workers: {}", e);
                    errors.push(e);
                }
            }
        }

        match flatten(sink.await) {
            Ok(written) => stats.results_written = written,
            Err(e) => {
                error!("Result sink failed: {}", e);
                errors.push(e);
            }
        }

        stats.total_time_ms = start.elapsed().as_millis() as u64;

        // report the root cause, not the stages that merely saw a queue close
        if let Some(index) = errors.iter().position(|e| !e.is_queue_closed()) {
            return Err(errors.swap_remove(index));
        }
        if !worker_failures.is_empty() {
            return Err(PipelineError::WorkersFailed {
                count: worker_failures.len(),
                first: Box::new(worker_failures.remove(0)),
            });
        }
        if let Some(e) = errors.into_iter().next() {
            return Err(e);
        }

        info!(
            "Run {} finished in {:.2?}: {} records read, {} results written in {} batches (avg {:.1} per batch)",
            stats.run_id,
            start.elapsed(),
            stats.records_read,
            stats.results_written,
            stats.batches_flushed,
            stats.average_batch_size()
        );
        if !stats.is_complete() {
            warn!(
                "Run {}: {} records read but {} results written",
                stats.run_id, stats.records_read, stats.results_written
            );
        }
        Ok(stats)
    }

    fn record_worker(&self, stats: &mut PipelineStats, worker: &WorkerStats) {
        debug!(
            "Worker {} finished: {} records, {} batches ({} partial), {:.2?} in inference",
            worker.worker_id,
            worker.records,
            worker.batches,
            worker.partial_batches,
            worker.inference_time
        );
        stats.add_worker(worker);
    }
}

fn flatten<T>(
    joined: Result<Result<T, PipelineError>, tokio::task::JoinError>,
) -> Result<T, PipelineError> {
    joined?
}
