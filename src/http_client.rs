//! Narrow HTTP seam the detection engine benchmarks through. Kept separate
//! from [`crate::supervisor`] so a benchmark-time fake can stand in without
//! a real server.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SwitchboardError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionTimings {
    pub prompt_per_second: f64,
    pub predicted_per_second: f64,
}

#[async_trait]
pub trait CompletionsClient: Send + Sync {
    async fn health(&self, base_url: &str) -> Result<bool>;
    async fn complete(&self, base_url: &str, prompt: &str, n_predict: u32) -> Result<CompletionTimings>;
}

/// Default [`CompletionsClient`], talking to a real `llama-server` over
/// `reqwest`.
pub struct ReqwestCompletionsClient {
    client: reqwest::Client,
}

impl ReqwestCompletionsClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }
}

impl Default for ReqwestCompletionsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    timings: Timings,
}

#[derive(Deserialize)]
struct Timings {
    prompt_per_second: f64,
    predicted_per_second: f64,
}

#[async_trait]
impl CompletionsClient for ReqwestCompletionsClient {
    async fn health(&self, base_url: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{base_url}/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| SwitchboardError::ProtocolError {
                reason: e.to_string(),
            })?;
        Ok(resp.status().is_success())
    }

    async fn complete(&self, base_url: &str, prompt: &str, n_predict: u32) -> Result<CompletionTimings> {
        let body = serde_json::json!({
            "prompt": prompt,
            "n_predict": n_predict,
        });
        let resp = self
            .client
            .post(format!("{base_url}/completion"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SwitchboardError::ProtocolError {
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::ProtocolError {
                reason: format!("completion request returned status {}", resp.status()),
            });
        }
        let parsed: CompletionResponse = resp.json().await.map_err(|e| SwitchboardError::ProtocolError {
            reason: format!("malformed completion response: {e}"),
        })?;
        Ok(CompletionTimings {
            prompt_per_second: parsed.timings.prompt_per_second,
            predicted_per_second: parsed.timings.predicted_per_second,
        })
    }
}
