// src/services/inference.rs

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::services::config::{
    DEFAULT_INPUT_TENSOR, DEFAULT_REQUEST_TIMEOUT_SECS, DIAL_TIMEOUT_SECS,
};
use crate::services::connection::{Dialer, InferenceConnection};
use crate::services::error::InferenceError;

/// Request body of the v2 inference protocol
#[derive(Debug, Serialize)]
pub struct InferRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub inputs: Vec<InferInputTensor<'a>>,
}

#[derive(Debug, Serialize)]
pub struct InferInputTensor<'a> {
    pub name: &'a str,
    pub shape: [usize; 2],
    pub datatype: &'static str,
    pub data: &'a [f64],
}

/// Response body of the v2 inference protocol
#[derive(Debug, Deserialize)]
pub struct InferResponse {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub outputs: Vec<InferOutputTensor>,
}

#[derive(Debug, Deserialize)]
pub struct InferOutputTensor {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<i64>,
    #[serde(default)]
    pub datatype: String,
    pub data: Vec<f64>,
}

/// Dials KServe-style v2 REST endpoints
#[derive(Clone, Debug)]
pub struct HttpDialer {
    dial_timeout: Duration,
    request_timeout: Duration,
    input_tensor: String,
    check_ready: bool,
}

impl Default for HttpDialer {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            input_tensor: DEFAULT_INPUT_TENSOR.to_string(),
            check_ready: true,
        }
    }
}

impl HttpDialer {
    pub fn new(dial_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            request_timeout,
            ..Default::default()
        }
    }

    pub fn with_input_tensor(mut self, name: impl Into<String>) -> Self {
        self.input_tensor = name.into();
        self
    }

    /// Whether dialing probes `/v2/health/ready` before handing out the connection
    pub fn with_readiness_check(mut self, check_ready: bool) -> Self {
        self.check_ready = check_ready;
        self
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, host: &str) -> Result<Arc<dyn InferenceConnection>, InferenceError> {
        let base_url = normalize_host(host)?;
        let client = Client::builder()
            .connect_timeout(self.dial_timeout)
            .timeout(self.request_timeout)
            .build()?;

        if self.check_ready {
            let ready_url = join(&base_url, "v2/health/ready")?;
            let response = client.get(ready_url).send().await?;
            if !response.status().is_success() {
                return Err(InferenceError::NotReady(base_url.to_string()));
            }
            info!("Inference server {} is ready", base_url);
        }

        Ok(Arc::new(HttpConnection {
            client,
            base_url,
            input_tensor: self.input_tensor.clone(),
        }))
    }
}

/// A pooled HTTP client bound to one server
pub struct HttpConnection {
    client: Client,
    base_url: Url,
    input_tensor: String,
}

#[async_trait]
impl InferenceConnection for HttpConnection {
    async fn infer(
        &self,
        model_name: &str,
        shape: [usize; 2],
        contents: &[f64],
    ) -> Result<Vec<f64>, InferenceError> {
        let url = join(&self.base_url, &format!("v2/models/{}/infer", model_name))?;
        let request = InferRequest {
            id: None,
            inputs: vec![InferInputTensor {
                name: &self.input_tensor,
                shape,
                datatype: "FP64",
                data: contents,
            }],
        };

        let start = Instant::now();
        let response = self.client.post(url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(InferenceError::Status { status, body });
        }

        let body: InferResponse = response.json().await?;
        debug!(
            "Model {} answered {} rows in {:.2?}",
            model_name,
            shape[0],
            start.elapsed()
        );

        body.outputs
            .into_iter()
            .next()
            .map(|output| output.data)
            .ok_or(InferenceError::EmptyResponse)
    }
}

/// Turns `host[:port]` or a full URL into a base URL ending in `/`
pub fn normalize_host(host: &str) -> Result<Url, InferenceError> {
    let host = host.trim();
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| InferenceError::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(InferenceError::InvalidHost {
            host: host.to_string(),
            reason: "missing host name".to_string(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, path: &str) -> Result<Url, InferenceError> {
    base.join(path).map_err(|e| InferenceError::InvalidHost {
        host: base.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host_adds_scheme_and_slash() {
        let url = normalize_host("localhost:8080").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");

        let url = normalize_host("https://models.internal/serving").unwrap();
        assert_eq!(url.as_str(), "https://models.internal/serving/");
        assert_eq!(
            join(&url, "v2/models/ctr/infer").unwrap().as_str(),
            "https://models.internal/serving/v2/models/ctr/infer"
        );
    }

    #[test]
    fn test_normalize_host_rejects_garbage() {
        assert!(normalize_host("http://").is_err());
        assert!(normalize_host("").is_err());
    }

    #[test]
    fn test_request_encoding() {
        let data = [1.0, 2.0, 3.0, 4.0];
        let request = InferRequest {
            id: None,
            inputs: vec![InferInputTensor {
                name: "input-0",
                shape: [2, 2],
                datatype: "FP64",
                data: &data,
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "inputs": [{
                    "name": "input-0",
                    "shape": [2, 2],
                    "datatype": "FP64",
                    "data": [1.0, 2.0, 3.0, 4.0]
                }]
            })
        );
    }

    #[test]
    fn test_response_decoding() {
        let body = r#"{
            "model_name": "ctr",
            "outputs": [{"name": "output-0", "shape": [2, 1], "datatype": "FP32", "data": [0.25, 0.75]}]
        }"#;
        let response: InferResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.model_name, "ctr");
        assert_eq!(response.outputs[0].data, vec![0.25, 0.75]);
        assert_eq!(response.outputs[0].shape, vec![2, 1]);
    }
}
