// Fallback image provider client
// Only used after the primary provider has exhausted its poll budget.

use super::status::{StatusVocabulary, FALLBACK_IMAGE};
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
pub struct FallbackImageClient {
    api_key: String,
    client: Client,
    base_url: String,
    aspect_ratio: String,
}

#[derive(Serialize, Debug)]
pub struct GenerationBody {
    pub prompt: String,
    pub aspect_ratio: String,
    pub output_format: &'static str,
}

#[derive(Deserialize, Debug)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct ResultResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ImageEntry {
    pub url: String,
}

impl FallbackImageClient {
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
        })
    }

    fn build_body(&self, request: &GenerationRequest) -> Result<GenerationBody, SubmitError> {
        match request {
            GenerationRequest::Imagine { prompt } => Ok(GenerationBody {
                prompt: prompt.trim().to_string(),
                aspect_ratio: self.aspect_ratio.clone(),
                output_format: "png",
            }),
            GenerationRequest::Action { action, .. } => Err(SubmitError::Unsupported(format!(
                "fallback provider has no '{}' action",
                action
            ))),
            GenerationRequest::Animate { .. } => Err(SubmitError::Unsupported(
                "fallback provider only generates still images".to_string(),
            )),
        }
    }
}

#[async_trait]
impl GenerationProvider for FallbackImageClient {
    fn name(&self) -> &'static str {
        "fallback-image"
    }

    fn vocabulary(&self) -> &'static StatusVocabulary {
        &FALLBACK_IMAGE
    }

    async fn create_task(&self, request: &GenerationRequest) -> Result<String, SubmitError> {
        let body = self.build_body(request)?;
        let url = format!("{}/v1/images/generations", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_submit_failure(status, error_text));
        }

        let created: CreatedResponse = response
            .json()
            .await
            .map_err(|e| SubmitError::Network(format!("unreadable submit response: {}", e)))?;
        Ok(created.id)
    }

    async fn fetch_status(&self, task_id: &str) -> Result<RawStatus, String> {
        let url = format!("{}/v1/images/generations/{}", self.base_url, task_id);

        let response = self
            .client
            .get(&url)
            .header("x-key", &self.api_key)
            .send()
            .await
            .map_err(|e| format!("Fallback status request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("Fallback status API error ({}): {}", status, error_text));
        }

        let result: ResultResponse = response
            .json()
            .await
            .map_err(|e| format!("Fallback status response unreadable: {}", e))?;
        Ok(raw_status_from(result))
    }
}

fn raw_status_from(result: ResultResponse) -> RawStatus {
    RawStatus {
        status: result.status,
        output_urls: result.images.into_iter().map(|i| i.url).collect(),
        actions: Vec::new(),
        error: result.error.filter(|e| !e.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> FallbackImageClient {
        FallbackImageClient::new(
            &ProviderSettings {
                api_key: "k".to_string(),
                endpoint: "https://fallback.example.com".to_string(),
            },
            &GenerationParams {
                aspect_ratio: "9:16".to_string(),
                model_version: "6.1".to_string(),
                webhook_url: None,
                webhook_secret: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_imagine_body_keeps_prompt_and_ratio() {
        let body = client()
            .build_body(&GenerationRequest::Imagine {
                prompt: " misty harbor ".to_string(),
            })
            .unwrap();
        assert_eq!(body.prompt, "misty harbor");
        assert_eq!(body.aspect_ratio, "9:16");
    }

    #[test]
    fn test_actions_are_unsupported() {
        let err = client()
            .build_body(&GenerationRequest::Action {
                parent_task_id: "p".to_string(),
                action: "upscale1".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SubmitError::Unsupported(_)));
    }

    #[test]
    fn test_result_parsing() {
        let result: ResultResponse = serde_json::from_value(serde_json::json!({
            "status": "Ready",
            "images": [{ "url": "https://cdn.example.com/f.png" }]
        }))
        .unwrap();
        let raw = raw_status_from(result);
        assert_eq!(raw.status, "Ready");
        assert_eq!(raw.output_urls, vec!["https://cdn.example.com/f.png".to_string()]);
        assert!(raw.actions.is_empty());
    }
}
