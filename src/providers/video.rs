// Image-to-video provider client
// Video tasks have no fallback slot; exhausted video tasks are abandoned.

use super::status::{StatusVocabulary, VIDEO};
use super::{
    build_client, classify_submit_failure, classify_transport_failure, GenerationProvider,
    RawStatus, SubmitError,
};
use crate::config::{GenerationParams, ProviderSettings};
use crate::store::documents::GenerationRequest;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct VideoClient {
    api_key: String,
    client: Client,
    base_url: String,
    aspect_ratio: String,
    callback_url: Option<String>,
}

// ============================================================================
// API REQUEST/RESPONSE STRUCTURES
// ============================================================================

#[derive(Serialize, Debug)]
pub struct Image2VideoRequest {
    pub image: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub duration: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct VideoEnvelope {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<VideoTaskData>,
}

#[derive(Deserialize, Debug, Default)]
pub struct VideoTaskData {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub task_status: String,
    #[serde(default)]
    pub task_status_msg: Option<String>,
    #[serde(default)]
    pub task_result: Option<VideoTaskResult>,
}

#[derive(Deserialize, Debug, Default)]
pub struct VideoTaskResult {
    #[serde(default)]
    pub videos: Vec<VideoEntry>,
}

#[derive(Deserialize, Debug)]
pub struct VideoEntry {
    pub url: String,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl VideoClient {
    pub fn new(
        settings: &ProviderSettings,
        params: &GenerationParams,
        timeout: Duration,
    ) -> Result<Self, SubmitError> {
        Ok(Self {
            api_key: settings.api_key.clone(),
            client: build_client(timeout)?,
            base_url: settings.endpoint.trim_end_matches('/').to_string(),
            aspect_ratio: params.aspect_ratio.clone(),
            callback_url: params.webhook_url.clone(),
        })
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Image2VideoRequest, SubmitError> {
        match request {
            GenerationRequest::Animate { prompt, image_url } => Ok(Image2VideoRequest {
                image: image_url.clone(),
                prompt: prompt.trim().to_string(),
                aspect_ratio: self.aspect_ratio.clone(),
                duration: "5",
                callback_url: self.callback_url.clone(),
            }),
            _ => Err(SubmitError::Unsupported(
                "video provider needs an image and a motion prompt".to_string(),
            )),
        }
    }
}

#[async_trait]
impl GenerationProvider for VideoClient {
    fn name(&self) -> &'static str {
        "video"
    }

    fn vocabulary(&self) -> &'static StatusVocabulary {
        &VIDEO
    }

    async fn create_task(&self, request: &GenerationRequest) -> Result<String, SubmitError> {
        let body = self.build_request(request)?;
        let url = format!("{}/v1/videos/image2video", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_submit_failure(status, error_text));
        }

        let envelope: VideoEnvelope = response
            .json()
            .await
            .map_err(|e| SubmitError::Network(format!("unreadable submit response: {}", e)))?;

        match envelope.data {
            Some(data) if envelope.code == 0 && !data.task_id.is_empty() => Ok(data.task_id),
            _ => Err(SubmitError::PromptRejected(format!(
                "code {}: {}",
                envelope.code, envelope.message
            ))),
        }
    }

    async fn fetch_status(&self, task_id: &str) -> Result<RawStatus, String> {
        let url = format!("{}/v1/videos/image2video/{}", self.base_url, task_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| format!("Video status request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("Video status API error ({}): {}", status, error_text));
        }

        let envelope: VideoEnvelope = response
            .json()
            .await
            .map_err(|e| format!("Video status response unreadable: {}", e))?;
        let data = envelope
            .data
            .ok_or_else(|| format!("Video status response has no data: {}", envelope.message))?;
        Ok(raw_status_from(data))
    }
}

fn raw_status_from(data: VideoTaskData) -> RawStatus {
    RawStatus {
        status: data.task_status,
        output_urls: data
            .task_result
            .map(|r| r.videos.into_iter().map(|v| v.url).collect())
            .unwrap_or_default(),
        actions: Vec::new(),
        error: data.task_status_msg.filter(|m| !m.is_empty()),
    }
}
