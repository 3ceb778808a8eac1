use crate::config::{SummarizerBackend, SummarizerProfile};
use crate::types::{RelayError, Result, SummaryResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Request the gateway sends to the summarizer backend, verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub text: String,
    pub persona: String,
    pub language: String,
    pub model: String,
}

impl SummaryRequest {
    pub fn new(text: impl Into<String>, profile: &SummarizerProfile, model_id: &str) -> Self {
        Self {
            text: text.into(),
            persona: profile.persona.clone(),
            language: profile.output_language.clone(),
            model: model_id.to_string(),
        }
    }
}

/// Stateless summarization seam. Implementations must be safe to call
/// concurrently; results are recomputed per delivery attempt.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult>;
}

#[derive(Debug, Deserialize)]
struct BackendResponse {
    summary: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Gateway to an HTTP summarizer backend.
pub struct HttpSummarizer {
    client: Client,
    endpoint: String,
    model_id: String,
}

impl HttpSummarizer {
    pub fn new(backend: &SummarizerBackend) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(backend.timeout_seconds))
            .build()
            .map_err(|e| RelayError::Summarization(format!("failed to build client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: backend.endpoint.clone(),
            model_id: backend.model_id.clone(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[async_trait]
impl Summarize for HttpSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult> {
        debug!(
            "summarizing {} chars with model {} ({})",
            request.text.len(),
            request.model,
            request.language
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::Summarization(format!("backend unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Summarization(format!(
                "backend returned HTTP {}",
                status
            )));
        }

        let body: BackendResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Summarization(format!("malformed backend response: {}", e)))?;

        if body.summary.trim().is_empty() {
            return Err(RelayError::Summarization(
                "backend returned an empty summary".to_string(),
            ));
        }

        Ok(SummaryResult {
            summary: body.summary,
            detail: body.detail,
            language: request.language.clone(),
            model_id: request.model.clone(),
        })
    }
}
