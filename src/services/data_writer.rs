// src/services/data_writer.rs

use csv::WriterBuilder;
use log::info;
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::services::error::PipelineError;
use crate::services::types::InferenceResult;

/// Tracks progress during long-running writes
///
/// Logs at most once per `update_interval` unless forced.
pub struct ProgressTracker {
    processed: u64,
    start_time: Instant,
    last_update_time: Instant,
    update_interval: Duration,
}

impl ProgressTracker {
    pub fn new(update_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            processed: 0,
            start_time: now,
            last_update_time: now,
            update_interval,
        }
    }

    /// Adds `count` to the total and logs if the interval has passed.
    /// Returns whether a progress line was emitted.
    pub fn update(&mut self, count: u64, force: bool) -> bool {
        self.processed += count;

        let now = Instant::now();
        if !force && now.duration_since(self.last_update_time) < self.update_interval {
            return false;
        }
        self.last_update_time = now;

        let elapsed = now.duration_since(self.start_time);
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            "Wrote {} results in {:.2?} ({:.1} results/s)",
            self.processed, elapsed, rate
        );
        true
    }

    pub fn get_stats(&self) -> (u64, Duration) {
        (self.processed, self.start_time.elapsed())
    }
}

/// Writes `entity_key,value` rows in the order results arrive
///
/// Rows are buffered and flushed every `flush_every` rows and once more when
/// the result queue closes.
pub struct ResultWriter<W: Write> {
    writer: csv::Writer<W>,
    flush_every: usize,
    pending: usize,
    written: usize,
    progress: ProgressTracker,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(output: W, flush_every: usize, progress_interval: Duration) -> Self {
        let writer = WriterBuilder::new().has_headers(false).from_writer(output);
        Self {
            writer,
            flush_every: flush_every.max(1),
            pending: 0,
            written: 0,
            progress: ProgressTracker::new(progress_interval),
        }
    }

    pub fn write(&mut self, result: &InferenceResult) -> Result<(), PipelineError> {
        let value = result.value.to_string();
        self.writer
            .write_record([result.entity_key.as_str(), value.as_str()])?;
        self.pending += 1;
        self.written += 1;

        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        self.writer.flush()?;
        self.progress.update(self.pending as u64, false);
        self.pending = 0;
        Ok(())
    }

    /// Drains `results` until every worker has dropped its sender.
    ///
    /// Blocks the calling thread; run it on a blocking task. Returns the
    /// number of rows written.
    pub fn consume(
        &mut self,
        mut results: mpsc::Receiver<InferenceResult>,
    ) -> Result<usize, PipelineError> {
        while let Some(result) = results.blocking_recv() {
            self.write(&result)?;
        }
        self.writer.flush()?;
        self.progress.update(self.pending as u64, true);
        self.pending = 0;
        Ok(self.written)
    }

    /// Flushes and hands back the underlying output
    pub fn into_inner(self) -> Result<W, PipelineError> {
        self.writer
            .into_inner()
            .map_err(|e| PipelineError::Flush(e.into_error()))
    }
}
