// src/bin/inspect_mapping.rs
use anyhow::{Context, Result};
use log::info;
use std::path::{Path, PathBuf};

use batch_inference_lib::FeatureMapping;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Try to load .env file if it exists
    let env_paths = [".env", ".env.local", "../.env"];
    for path in env_paths.iter() {
        if Path::new(path).exists() && dotenv::from_filename(path).is_ok() {
            info!("Loaded environment variables from {}", path);
            break;
        }
    }

    // First argument wins over MAPPING_DIR
    let dir = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => PathBuf::from(
            std::env::var("MAPPING_DIR")
                .context("Usage: inspect_mapping <mapping-dir> (or set MAPPING_DIR)")?,
        ),
    };

    let mapping = FeatureMapping::load(&dir)
        .with_context(|| format!("Failed to load feature mappings from {}", dir.display()))?;
    info!(
        "Loaded {} feature tables from {}: {}",
        mapping.len(),
        dir.display(),
        mapping.features().join(", ")
    );

    let json = serde_json::to_string_pretty(&mapping.snapshot())
        .context("Failed to encode mapping snapshot")?;
    println!("{}", json);

    Ok(())
}
