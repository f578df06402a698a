//! Entailment over a text-classification inference server
//!
//! Protocol:
//! - `GET {endpoint}/health` answers 2xx when the model is loaded
//! - `POST {endpoint}/predict` with `{"inputs": [[premise, hypothesis], ...]}`
//!   returns, per pair, a list of `{label, score}` over the NLI labels
//!
//! The primary endpoint is expected to be the accelerated deployment; the
//! fallback usually runs on CPU.

use super::EntailmentModel;
use crate::config::ClassifierConfig;
use crate::error::CoreError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const ENTAILMENT_LABEL: &str = "entailment";

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    inputs: Vec<[&'a str; 2]>,
}

#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f32,
}

/// NLI model served over HTTP
pub struct HttpEntailmentModel {
    client: Client,
    endpoint: String,
}

impl HttpEntailmentModel {
    /// Pick the first endpoint that answers its health probe
    pub async fn connect(config: &ClassifierConfig) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| CoreError::unavailable(format!("failed to build HTTP client: {}", e)))?;

        let candidates = std::iter::once(config.endpoint.as_str())
            .chain(config.fallback_endpoint.as_deref());

        let mut tried = Vec::new();
        for endpoint in candidates {
            let endpoint = endpoint.trim_end_matches('/').to_string();
            if Self::healthy(&client, &endpoint).await {
                info!(%endpoint, "Using entailment backend");
                return Ok(Self { client, endpoint });
            }
            warn!(%endpoint, "Entailment backend not answering");
            tried.push(endpoint);
        }

        Err(CoreError::unavailable(format!(
            "no entailment backend answered (tried {})",
            tried.join(", ")
        )))
    }

    async fn healthy(client: &Client, endpoint: &str) -> bool {
        match client.get(format!("{}/health", endpoint)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(%endpoint, error = %e, "Health probe failed");
                false
            }
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Pull the entailment probability out of each per-pair label distribution
fn entailment_scores(
    predictions: Vec<Vec<LabelScore>>,
    expected: usize,
) -> Result<Vec<f32>, CoreError> {
    if predictions.len() != expected {
        return Err(CoreError::unavailable(format!(
            "expected {} predictions, got {}",
            expected,
            predictions.len()
        )));
    }
    predictions
        .into_iter()
        .map(|labels| {
            labels
                .into_iter()
                .find(|l| l.label.eq_ignore_ascii_case(ENTAILMENT_LABEL))
                .map(|l| l.score)
                .ok_or_else(|| CoreError::unavailable("prediction has no entailment label"))
        })
        .collect()
}

#[async_trait]
impl EntailmentModel for HttpEntailmentModel {
    async fn entailment(&self, premise: &str, hypotheses: &[String]) -> Result<Vec<f32>, CoreError> {
        let body = PredictRequest {
            inputs: hypotheses.iter().map(|h| [premise, h.as_str()]).collect(),
        };

        let response = self
            .client
            .post(format!("{}/predict", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::unavailable(format!("{}: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            return Err(CoreError::unavailable(format!(
                "{} answered HTTP {}",
                self.endpoint,
                response.status()
            )));
        }

        let predictions: Vec<Vec<LabelScore>> = response
            .json()
            .await
            .map_err(|e| CoreError::unavailable(format!("invalid prediction body: {}", e)))?;

        entailment_scores(predictions, hypotheses.len())
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}
