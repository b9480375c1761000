// src/services/connection.rs

use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::services::error::InferenceError;

/// A long-lived channel to one inference server
///
/// Implementations must be usable from several tasks at once.
#[async_trait]
pub trait InferenceConnection: Send + Sync {
    /// Submits one batch and returns one scalar per row, in row order
    ///
    /// # Arguments
    /// * `model_name` - Model to run on the server
    /// * `shape` - `[record_count, vector_width]` of `contents`
    /// * `contents` - Row-major flattened feature vectors
    async fn infer(
        &self,
        model_name: &str,
        shape: [usize; 2],
        contents: &[f64],
    ) -> Result<Vec<f64>, InferenceError>;
}

/// Opens connections for the [`ConnectionCache`]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str) -> Result<Arc<dyn InferenceConnection>, InferenceError>;
}

/// Memoizes one connection per host
///
/// The lock is held across the dial so concurrent first requests for a host
/// dial exactly once. Entries are never evicted.
pub struct ConnectionCache<D> {
    dialer: D,
    conns: Mutex<HashMap<String, Arc<dyn InferenceConnection>>>,
}

impl<D: Dialer> ConnectionCache<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_connection(
        &self,
        host: &str,
    ) -> Result<Arc<dyn InferenceConnection>, InferenceError> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(host) {
            return Ok(conn.clone());
        }

        info!("Dialing inference host {}", host);
        let conn = self.dialer.dial(host).await?;
        conns.insert(host.to_string(), conn.clone());
        Ok(conn)
    }

    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.lock().await.is_empty()
    }
}
