// src/services/worker.rs

use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

use crate::services::batch::BatchAccumulator;
use crate::services::connection::InferenceConnection;
use crate::services::error::{InferenceError, PipelineError};
use crate::services::shutdown::ShutdownListener;
use crate::services::types::{InferenceResult, Record, WorkerStats};

/// Request queue shared by every worker
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Pulling records and flushing full batches
    Running,
    /// Input exhausted; emptying the queue before the final flush
    Draining,
    Done,
}

/// One member of the inference worker pool
pub struct InferenceWorker {
    id: usize,
    connection: Arc<dyn InferenceConnection>,
    model_name: Arc<str>,
    batch_size: usize,
    requests: SharedReceiver<Record>,
    results: mpsc::Sender<InferenceResult>,
    shutdown: ShutdownListener,
    active_workers: Arc<AtomicUsize>,
    state: WorkerState,
    stats: WorkerStats,
}

impl InferenceWorker {
    /// Creates a worker and registers it in `active_workers`
    ///
    /// # Arguments
    /// * `id` - Worker index, used in logs and errors
    /// * `connection` - Connection obtained for this worker at start-up
    /// * `model_name` - Model to run on the server
    /// * `batch_size` - Records per full batch
    /// * `requests` - Shared request queue
    /// * `results` - Response queue towards the sink
    /// * `shutdown` - End-of-input signal
    /// * `active_workers` - Completion counter shared by the pool
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        connection: Arc<dyn InferenceConnection>,
        model_name: Arc<str>,
        batch_size: usize,
        requests: SharedReceiver<Record>,
        results: mpsc::Sender<InferenceResult>,
        shutdown: ShutdownListener,
        active_workers: Arc<AtomicUsize>,
    ) -> Self {
        active_workers.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            connection,
            model_name,
            batch_size: batch_size.max(1),
            requests,
            results,
            shutdown,
            active_workers,
            state: WorkerState::Running,
            stats: WorkerStats {
                worker_id: id,
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs the worker until Done and returns its counters.
    ///
    /// The completion counter is decremented whether the worker succeeds or
    /// fails; the result sender is dropped on return, and the response queue
    /// closes once the last worker is gone.
    pub async fn run(mut self) -> Result<WorkerStats, PipelineError> {
        let outcome = self.process().await;

        let remaining = self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            info!("Worker {}: last worker done, closing result queue", self.id);
        }

        outcome
            .map(|_| self.stats.clone())
            .map_err(|source| PipelineError::Worker {
                worker_id: self.id,
                source: Box::new(source),
            })
    }

    async fn process(&mut self) -> Result<(), PipelineError> {
        let mut batch = BatchAccumulator::with_capacity(self.batch_size);

        loop {
            match self.state {
                WorkerState::Running => {
                    let requests = self.requests.clone();
                    tokio::select! {
                        record = next_record(&requests) => match record {
                            Some(record) => {
                                batch.add_record(record)?;
                                if batch.len() >= self.batch_size {
                                    self.flush(std::mem::take(&mut batch)).await?;
                                }
                            }
                            None => {
                                debug!("Worker {}: request queue closed", self.id);
                                self.state = WorkerState::Draining;
                            }
                        },
                        _ = self.shutdown.fired() => {
                            debug!("Worker {}: end of input signalled", self.id);
                            self.state = WorkerState::Draining;
                        }
                    }
                }
                WorkerState::Draining => {
                    while let Some(record) = try_next_record(&self.requests).await {
                        batch.add_record(record)?;
                        if batch.len() >= self.batch_size {
                            self.flush(std::mem::take(&mut batch)).await?;
                        }
                    }
                    if !batch.is_empty() {
                        self.flush(std::mem::take(&mut batch)).await?;
                    }
                    self.state = WorkerState::Done;
                }
                WorkerState::Done => {
                    debug!(
                        "Worker {}: done after {} records in {} batches",
                        self.id, self.stats.records, self.stats.batches
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Submits one batch and fans its results out to the sink, in order.
    async fn flush(&mut self, batch: BatchAccumulator) -> Result<(), PipelineError> {
        let batch_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let (count, width) = batch.shape();
        let (entity_keys, contents) = batch.into_parts();

        debug!(
            "Worker {}: flushing batch {} with shape [{}, {}]",
            self.id, batch_id, count, width
        );
        let start = Instant::now();
        let values = self
            .connection
            .infer(&self.model_name, [count, width], &contents)
            .await?;
        let elapsed = start.elapsed();

        if values.len() != count {
            return Err(InferenceError::ResultCount {
                expected: count,
                got: values.len(),
            }
            .into());
        }

        for (entity_key, value) in entity_keys.into_iter().zip(values) {
            self.results
                .send(InferenceResult { entity_key, value })
                .await
                .map_err(|_| PipelineError::ResultQueueClosed)?;
        }

        self.stats.records += count;
        self.stats.batches += 1;
        if count < self.batch_size {
            self.stats.partial_batches += 1;
        }
        self.stats.inference_time += elapsed;
        debug!(
            "Worker {}: batch {} done in {:.2?}",
            self.id, batch_id, elapsed
        );
        Ok(())
    }
}

async fn next_record(requests: &SharedReceiver<Record>) -> Option<Record> {
    requests.lock().await.recv().await
}

/// Takes one queued record without waiting for new ones
async fn try_next_record(requests: &SharedReceiver<Record>) -> Option<Record> {
    requests.lock().await.try_recv().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::shutdown::ShutdownSignal;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Returns the first feature of each row and records every batch shape
    #[derive(Default)]
    struct RecordingConnection {
        shapes: StdMutex<Vec<[usize; 2]>>,
    }

    #[async_trait]
    impl InferenceConnection for RecordingConnection {
        async fn infer(
            &self,
            _model_name: &str,
            shape: [usize; 2],
            contents: &[f64],
        ) -> Result<Vec<f64>, InferenceError> {
            self.shapes.lock().unwrap().push(shape);
            Ok(contents.chunks(shape[1]).map(|row| row[0]).collect())
        }
    }

    struct ShortConnection;

    #[async_trait]
    impl InferenceConnection for ShortConnection {
        async fn infer(
            &self,
            _model_name: &str,
            _shape: [usize; 2],
            _contents: &[f64],
        ) -> Result<Vec<f64>, InferenceError> {
            Ok(vec![1.0])
        }
    }

    fn spawn_worker(
        connection: Arc<dyn InferenceConnection>,
        batch_size: usize,
        records: Vec<Record>,
    ) -> (
        tokio::task::JoinHandle<Result<WorkerStats, PipelineError>>,
        mpsc::Receiver<InferenceResult>,
        Arc<AtomicUsize>,
    ) {
        let (req_tx, req_rx) = mpsc::channel(records.len().max(1));
        for record in records {
            req_tx.try_send(record).unwrap();
        }
        let (res_tx, res_rx) = mpsc::channel(64);
        let (signal, listener) = ShutdownSignal::new();
        let active = Arc::new(AtomicUsize::new(0));

        let worker = InferenceWorker::new(
            0,
            connection,
            Arc::from("ctr"),
            batch_size,
            Arc::new(Mutex::new(req_rx)),
            res_tx,
            listener,
            active.clone(),
        );
        assert_eq!(worker.state(), WorkerState::Running);
        signal.fire();
        // keep the queue open; only the signal can end the worker
        let handle = tokio::spawn(async move {
            let _keep_open = req_tx;
            let _keep_signal = signal;
            worker.run().await
        });
        (handle, res_rx, active)
    }

    fn records(keys: &[&str]) -> Vec<Record> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| Record::new(*key, vec![i as f64, 0.5]))
            .collect()
    }

    #[tokio::test]
    async fn test_drain_flushes_partial_batch_once() {
        let connection = Arc::new(RecordingConnection::default());
        let (handle, mut results, active) =
            spawn_worker(connection.clone(), 2, records(&["A", "B", "C", "D", "E"]));

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.records, 5);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.partial_batches, 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(
            *connection.shapes.lock().unwrap(),
            vec![[2, 2], [2, 2], [1, 2]]
        );

        let mut seen = Vec::new();
        while let Some(result) = results.recv().await {
            seen.push((result.entity_key, result.value));
        }
        assert_eq!(
            seen,
            vec![
                ("A".to_string(), 0.0),
                ("B".to_string(), 1.0),
                ("C".to_string(), 2.0),
                ("D".to_string(), 3.0),
                ("E".to_string(), 4.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_flush_without_records() {
        let connection = Arc::new(RecordingConnection::default());
        let (handle, _results, _active) = spawn_worker(connection.clone(), 4, Vec::new());

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.batches, 0);
        assert!(connection.shapes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_also_drains() {
        let connection = Arc::new(RecordingConnection::default());
        let (req_tx, req_rx) = mpsc::channel(4);
        let (res_tx, mut res_rx) = mpsc::channel(4);
        let (signal, listener) = ShutdownSignal::new();
        for record in records(&["A", "B", "C"]) {
            req_tx.send(record).await.unwrap();
        }
        drop(req_tx);

        let worker = InferenceWorker::new(
            3,
            connection.clone(),
            Arc::from("ctr"),
            2,
            Arc::new(Mutex::new(req_rx)),
            res_tx,
            listener,
            Arc::new(AtomicUsize::new(0)),
        );
        let stats = worker.run().await.unwrap();
        drop(signal);

        assert_eq!(stats.worker_id, 3);
        assert_eq!(stats.records, 3);
        let mut count = 0;
        while res_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_result_count_mismatch_fails_worker() {
        let (handle, _results, active) =
            spawn_worker(Arc::new(ShortConnection), 2, records(&["A", "B"]));

        let err = handle.await.unwrap().unwrap_err();
        match err {
            PipelineError::Worker { worker_id, source } => {
                assert_eq!(worker_id, 0);
                assert!(matches!(
                    *source,
                    PipelineError::Inference(InferenceError::ResultCount {
                        expected: 2,
                        got: 1
                    })
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_width_mismatch_fails_worker() {
        let connection = Arc::new(RecordingConnection::default());
        let mixed = vec![Record::new("A", vec![1.0, 2.0]), Record::new("B", vec![1.0])];
        let (handle, _results, _active) = spawn_worker(connection, 4, mixed);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Worker { ref source, .. } if matches!(**source, PipelineError::Batch(_))
        ));
    }
}
