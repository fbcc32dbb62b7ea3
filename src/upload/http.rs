use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::StatusCode;
use serde::Deserialize;

use super::uploader::{UploadFailure, UploadPayload, UploadReceipt, Uploader};

/// Error code the backend uses when an earlier series interval is missing.
pub const OUT_OF_ORDER_CODE: &str = "interval_out_of_order";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Submits sessions as JSON over HTTPS with bearer authentication.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vitalsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn submit(
        &self,
        payload: &UploadPayload,
        access_token: &str,
    ) -> Result<UploadReceipt, UploadFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| UploadFailure::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let receipt = response.json::<UploadReceipt>().await.map_err(|e| {
                UploadFailure::transient(format!("unreadable receipt ({status}): {e}"))
            })?;
            info!(
                "Backend accepted session {} (group {:?})",
                receipt.session_id, receipt.group_id
            );
            return Ok(receipt);
        }

        let body = response.text().await.unwrap_or_default();
        let failure = classify_rejection(status, &body);
        warn!(
            "Backend rejected session {} with {status}: {}",
            payload.session_id, failure.message
        );
        Err(failure)
    }
}

/// Maps a non-success response onto the failure taxonomy.
pub fn classify_rejection(status: StatusCode, body: &str) -> UploadFailure {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|b| b.code.as_deref());
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("server responded {status}")
            } else {
                format!("server responded {status}: {trimmed}")
            }
        });

    if code == Some(OUT_OF_ORDER_CODE) || status == StatusCode::CONFLICT {
        return UploadFailure::out_of_order(message);
    }

    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => UploadFailure::transient(message),
        s if s.is_server_error() => UploadFailure::transient(message),
        _ => UploadFailure::terminal(message),
    }
}
