// src/services/data_fetcher.rs

use csv::{ReaderBuilder, StringRecord, Trim};
use log::{debug, info};
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::services::error::PipelineError;
use crate::services::mapping::FeatureMapping;
use crate::services::shutdown::ShutdownSignal;
use crate::services::types::Record;

/// Reads input rows and feeds them to the workers
///
/// Column 0 of every row is the entity key; the remaining columns are resolved
/// through the feature mapping using the header name of their column. Without
/// a header, columns are named by their 1-based position.
///
/// Runs on a blocking thread: `blocking_send` on the bounded request queue is
/// the pipeline's only backpressure.
pub struct RecordSource<R> {
    reader: csv::Reader<R>,
    mapping: Arc<FeatureMapping>,
    has_headers: bool,
}

impl<R: Read> RecordSource<R> {
    /// # Arguments
    /// * `input` - Comma-delimited rows
    /// * `mapping` - Lookup tables shared with the rest of the pipeline
    /// * `has_headers` - Whether the first row names the columns
    pub fn new(input: R, mapping: Arc<FeatureMapping>, has_headers: bool) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(has_headers)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(input);

        Self {
            reader,
            mapping,
            has_headers,
        }
    }

    /// Pushes every record onto `queue`, then fires `shutdown` exactly once.
    ///
    /// Returns the number of records produced. A malformed row stops the
    /// source without firing the signal; the queue still closes when `queue`
    /// is dropped.
    pub fn run(
        mut self,
        queue: mpsc::Sender<Record>,
        shutdown: ShutdownSignal,
    ) -> Result<usize, PipelineError> {
        let start = Instant::now();
        let columns = self.column_names()?;
        let mut produced = 0;

        let mut row = StringRecord::new();
        loop {
            let line = self.reader.position().line();
            let more = self
                .reader
                .read_record(&mut row)
                .map_err(|source| PipelineError::Input { line, source })?;
            if !more {
                break;
            }

            let record = parse_row(&row, &columns, &self.mapping)?;
            queue
                .blocking_send(record)
                .map_err(|_| PipelineError::RequestQueueClosed)?;
            produced += 1;
        }

        if shutdown.fire() {
            info!(
                "Input exhausted after {} records in {:.2?}, signalling workers",
                produced,
                start.elapsed()
            );
        }
        Ok(produced)
    }

    fn column_names(&mut self) -> Result<Vec<String>, PipelineError> {
        if !self.has_headers {
            return Ok(Vec::new());
        }
        let headers = self
            .reader
            .headers()
            .map_err(|source| PipelineError::Input { line: 1, source })?;
        let names: Vec<String> = headers.iter().map(clean_cell).map(String::from).collect();
        debug!("Input columns: {:?}", names);
        Ok(names)
    }
}

/// Builds one record from a row
pub fn parse_row(
    row: &StringRecord,
    columns: &[String],
    mapping: &FeatureMapping,
) -> Result<Record, PipelineError> {
    let mut cells = row.iter().map(clean_cell);
    let entity_key = cells.next().unwrap_or_default().to_string();

    let mut vector = Vec::with_capacity(row.len().saturating_sub(1));
    for (offset, raw) in cells.enumerate() {
        let index = offset + 1;
        let value = match columns.get(index) {
            Some(feature) => mapping.lookup(feature, raw)?,
            None => mapping.lookup(&index.to_string(), raw)?,
        };
        vector.push(value);
    }

    Ok(Record { entity_key, vector })
}

/// Strips whitespace and the braces of `{1.0,2.0}` style rows
fn clean_cell(cell: &str) -> &str {
    cell.trim_matches(|c: char| c == '{' || c == '}' || c.is_whitespace())
}
