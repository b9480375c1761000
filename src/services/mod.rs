// src/services/mod.rs
pub mod batch;
pub mod config;
pub mod connection;
pub mod data_fetcher;
pub mod data_writer;
pub mod error;
pub mod inference;
pub mod mapping;
pub mod pipeline;
pub mod shutdown;
pub mod stats;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use types::{FeatureVector, InferenceResult, Record, WorkerStats};
