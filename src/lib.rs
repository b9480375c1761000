// src/lib.rs
pub mod services;

// Re-export important functionality
pub use services::config::{FailurePolicy, PipelineConfig, UnmappedPolicy};
pub use services::connection::{ConnectionCache, Dialer, InferenceConnection};
pub use services::error::PipelineError;
pub use services::inference::HttpDialer;
pub use services::mapping::FeatureMapping;
pub use services::pipeline::BatchPipeline;
pub use services::stats::PipelineStats;
