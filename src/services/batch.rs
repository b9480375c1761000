// src/services/batch.rs

use crate::services::error::BatchError;
use crate::services::types::Record;

/// Accumulates records into one flat request buffer
///
/// Owned by a single worker and replaced with a fresh accumulator after
/// every flush. Holds `contents.len() == record_count * vector_width`.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    entity_keys: Vec<String>,
    contents: Vec<f64>,
    vector_width: usize,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(records: usize) -> Self {
        Self {
            entity_keys: Vec::with_capacity(records),
            contents: Vec::new(),
            vector_width: 0,
        }
    }

    /// Appends a record's key and flattens its vector onto the buffer.
    ///
    /// The first record fixes the batch width; a later record of a different
    /// width is rejected and the batch is left untouched.
    pub fn add_record(&mut self, record: Record) -> Result<(), BatchError> {
        let width = record.width();
        if self.entity_keys.is_empty() {
            self.vector_width = width;
            self.contents.reserve(width * self.entity_keys.capacity().max(1));
        } else if width != self.vector_width {
            return Err(BatchError::WidthMismatch {
                entity_key: record.entity_key,
                expected: self.vector_width,
                found: width,
            });
        }

        self.contents.extend_from_slice(&record.vector);
        self.entity_keys.push(record.entity_key);
        Ok(())
    }

    /// `(record_count, vector_width)`, sent verbatim as the tensor shape
    pub fn shape(&self) -> (usize, usize) {
        (self.entity_keys.len(), self.vector_width)
    }

    pub fn len(&self) -> usize {
        self.entity_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_keys.is_empty()
    }

    pub fn entity_keys(&self) -> &[String] {
        &self.entity_keys
    }

    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<f64>) {
        (self.entity_keys, self.contents)
    }
}
