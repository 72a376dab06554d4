//! Client for the downstream order-extraction service.
//!
//! Ingestion never fails a sync: every outcome, transport errors included, is
//! folded into an [`IngestionResult`] that the caller records per message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;

/// Body of an email ingestion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestEmailRequest {
    pub email_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_from: Option<String>,
}

/// Successful response from the ingestion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestEmailResponse {
    pub job_id: String,
    pub source_id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome of one ingestion attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct IngestionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("failed to build ingestion HTTP client: {0}")]
    Client(String),
}

/// Hands a parsed message to the order-extraction service.
#[async_trait]
pub trait EmailIngestionClient: Send + Sync {
    async fn ingest(&self, user_id: Uuid, request: IngestEmailRequest) -> IngestionResult;
}

/// HTTP implementation posting to `{base}/api/v1/ingest/email`.
#[derive(Debug, Clone)]
pub struct TrackableIngestionClient {
    http_client: Client,
    base_url: String,
}

impl TrackableIngestionClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, IngestionError> {
        Self::new(
            config.ingestion_api_url.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
        )
    }

    pub fn new(base_url: String, timeout: Duration) -> Result<Self, IngestionError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestionError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmailIngestionClient for TrackableIngestionClient {
    async fn ingest(&self, user_id: Uuid, request: IngestEmailRequest) -> IngestionResult {
        let url = format!("{}/api/v1/ingest/email", self.base_url);

        let response = match self
            .http_client
            .post(&url)
            .header("X-User-ID", user_id.to_string())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "Email ingestion request failed");
                return IngestionResult::failed(err.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                user_id = %user_id,
                status = status.as_u16(),
                body = %body,
                "Email ingestion rejected"
            );
            return IngestionResult::failed(format!("Ingestion failed: {}", status.as_u16()));
        }

        match response.json::<IngestEmailResponse>().await {
            Ok(data) => IngestionResult {
                success: true,
                job_id: Some(data.job_id),
                source_id: Some(data.source_id),
                status: Some(data.status),
                error: None,
            },
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "Email ingestion response unreadable");
                IngestionResult::failed(err.to_string())
            }
        }
    }
}
