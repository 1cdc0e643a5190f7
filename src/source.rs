//! Upstream metrics API client

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::{PostKey, PostMetrics};

/// Where current counters for a post come from
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self, key: PostKey) -> Result<PostMetrics>;
}

/// Fetches counters from
/// `GET {base_url}/channels/{channel_id}/posts/{msg_id}/metrics`
pub struct HttpMetricsSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetricsSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, key: PostKey) -> String {
        format!(
            "{}/channels/{}/posts/{}/metrics",
            self.base_url, key.channel_id, key.msg_id
        )
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self, key: PostKey) -> Result<PostMetrics> {
        let response = self.client.get(self.url_for(key)).send().await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(AppError::NotFound(format!("post {} unknown upstream", key)));
            }
            status => {
                return Err(AppError::SourceError(format!(
                    "unexpected status {} for post {}",
                    status, key
                )));
            }
        }

        let metrics: PostMetrics = response.json().await?;
        if metrics.counters().iter().any(|c| *c < 0) {
            return Err(AppError::SourceError(format!(
                "negative counter reported for post {}",
                key
            )));
        }
        Ok(metrics)
    }
}
