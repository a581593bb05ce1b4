// Midjourney task API client (primary image provider)
// Supports: imagine, follow-up actions (upscale/variation), task status

use super::status::{StatusVocabulary, MIDJOURNEY};
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
pub struct MidjourneyClient {
    api_key: String,
    client: Client,
    base_url: String,
    params: GenerationParams,
}

// ============================================================================
// API REQUEST/RESPONSE STRUCTURES
// ============================================================================

#[derive(Serialize, Debug)]
pub struct CreateTaskRequest {
    pub model: &'static str,
    pub task_type: &'static str,
    pub input: TaskInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
}

#[derive(Serialize, Debug, Default)]
pub struct TaskInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct TaskConfig {
    pub webhook_config: WebhookConfig,
}

#[derive(Serialize, Debug)]
pub struct WebhookConfig {
    pub endpoint: String,
    pub secret: String,
}

#[derive(Deserialize, Debug)]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Deserialize, Debug)]
pub struct TaskData {
    pub task_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<TaskOutput>,
    #[serde(default)]
    pub error: Option<TaskErrorBody>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TaskOutput {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub temporary_image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TaskErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl MidjourneyClient {
    pub fn new(
        settings: &ProviderSettings,
        params: &GenerationParams,
        timeout: Duration,
    ) -> Result<Self, SubmitError> {
        Ok(Self {
            api_key: settings.api_key.clone(),
            client: build_client(timeout)?,
            base_url: settings.endpoint.trim_end_matches('/').to_string(),
            params: params.clone(),
        })
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<CreateTaskRequest, SubmitError> {
        let (task_type, input) = match request {
            GenerationRequest::Imagine { prompt } => (
                "imagine",
                TaskInput {
                    prompt: Some(format!("{} --v {}", prompt.trim(), self.params.model_version)),
                    aspect_ratio: Some(self.params.aspect_ratio.clone()),
                    ..Default::default()
                },
            ),
            GenerationRequest::Action {
                parent_task_id,
                action,
            } => {
                let (task_type, index) = split_action(action)?;
                (
                    task_type,
                    TaskInput {
                        origin_task_id: Some(parent_task_id.clone()),
                        index,
                        ..Default::default()
                    },
                )
            }
            GenerationRequest::Animate { .. } => {
                return Err(SubmitError::Unsupported(
                    "midjourney does not animate images".to_string(),
                ))
            }
        };

        let config = match (&self.params.webhook_url, &self.params.webhook_secret) {
            (Some(endpoint), Some(secret)) => Some(TaskConfig {
                webhook_config: WebhookConfig {
                    endpoint: endpoint.clone(),
                    secret: secret.clone(),
                },
            }),
            _ => None,
        };

        Ok(CreateTaskRequest {
            model: "midjourney",
            task_type,
            input,
            config,
        })
    }
}

/// `upscale2` → (`upscale`, Some("2")); `reroll` → (`reroll`, None).
fn split_action(action: &str) -> Result<(&'static str, Option<String>), SubmitError> {
    let digits_at = action
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(action.len());
    let (name, index) = action.split_at(digits_at);
    let task_type = match name {
        "upscale" => "upscale",
        "variation" => "variation",
        "reroll" => "reroll",
        other => {
            return Err(SubmitError::Unsupported(format!(
                "unknown midjourney action '{}'",
                other
            )))
        }
    };
    let index = if index.is_empty() {
        None
    } else {
        Some(index.to_string())
    };
    Ok((task_type, index))
}

#[async_trait]
impl GenerationProvider for MidjourneyClient {
    fn name(&self) -> &'static str {
        "midjourney"
    }

    fn vocabulary(&self) -> &'static StatusVocabulary {
        &MIDJOURNEY
    }

    async fn create_task(&self, request: &GenerationRequest) -> Result<String, SubmitError> {
        let body = self.build_request(request)?;
        let url = format!("{}/api/v1/task", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_failure)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_submit_failure(status, error_text));
        }

        let envelope: Envelope<TaskData> = response
            .json()
            .await
            .map_err(|e| SubmitError::Network(format!("unreadable submit response: {}", e)))?;

        match envelope.data {
            Some(data) if !data.task_id.is_empty() => Ok(data.task_id),
            _ => Err(SubmitError::PromptRejected(
                envelope
                    .message
                    .unwrap_or_else(|| format!("no task id in response (code {:?})", envelope.code)),
            )),
        }
    }

    async fn fetch_status(&self, task_id: &str) -> Result<RawStatus, String> {
        let url = format!("{}/api/v1/task/{}", self.base_url, task_id);

        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| format!("Midjourney status request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("Midjourney status API error ({}): {}", status, error_text));
        }

        let envelope: Envelope<TaskData> = response
            .json()
            .await
            .map_err(|e| format!("Midjourney status response unreadable: {}", e))?;
        let data = envelope
            .data
            .ok_or_else(|| "Midjourney status response has no data".to_string())?;

        Ok(raw_status_from(data))
    }
}

fn raw_status_from(data: TaskData) -> RawStatus {
    let output = data.output.unwrap_or_default();
    let output_urls = output
        .image_urls
        .filter(|urls| !urls.is_empty())
        .or(output.temporary_image_urls.filter(|urls| !urls.is_empty()))
        .or(output.image_url.map(|url| vec![url]))
        .unwrap_or_default();

    RawStatus {
        status: data.status.unwrap_or_default(),
        output_urls,
        actions: output.actions,
        error: data
            .error
            .and_then(|e| e.message)
            .filter(|m| !m.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(webhook: bool) -> MidjourneyClient {
        let params = GenerationParams {
            aspect_ratio: "9:16".to_string(),
            model_version: "6.1".to_string(),
            webhook_url: webhook.then(|| "https://hooks.example.com/hook".to_string()),
            webhook_secret: webhook.then(|| "s3cret".to_string()),
        };
        MidjourneyClient::new(
            &ProviderSettings {
                api_key: "k".to_string(),
                endpoint: "https://api.example.com/".to_string(),
            },
            &params,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_imagine_request_body() {
        let body = client(true)
            .build_request(&GenerationRequest::Imagine {
                prompt: "neon koi pond ".to_string(),
            })
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["task_type"], "imagine");
        assert_eq!(value["input"]["prompt"], "neon koi pond --v 6.1");
        assert_eq!(value["input"]["aspect_ratio"], "9:16");
        assert_eq!(value["config"]["webhook_config"]["secret"], "s3cret");
    }

    #[test]
    fn test_action_request_body() {
        let body = client(false)
            .build_request(&GenerationRequest::Action {
                parent_task_id: "parent".to_string(),
                action: "upscale2".to_string(),
            })
            .unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["task_type"], "upscale");
        assert_eq!(value["input"]["origin_task_id"], "parent");
        assert_eq!(value["input"]["index"], "2");
        assert!(value.get("config").is_none());
    }

    #[test]
    fn test_animate_is_unsupported() {
        let err = client(false)
            .build_request(&GenerationRequest::Animate {
                prompt: "p".to_string(),
                image_url: "u".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SubmitError::Unsupported(_)));
    }

    #[test]
    fn test_status_prefers_image_urls() {
        let data: TaskData = serde_json::from_value(serde_json::json!({
            "task_id": "t1",
            "status": "completed",
            "output": {
                "image_url": "https://cdn.example.com/grid.png",
                "image_urls": ["https://cdn.example.com/1.png", "https://cdn.example.com/2.png"],
                "actions": ["upscale1", "upscale2", "reroll"]
            }
        }))
        .unwrap();
        let raw = raw_status_from(data);
        assert_eq!(raw.status, "completed");
        assert_eq!(raw.output_urls.len(), 2);
        assert_eq!(raw.actions[0], "upscale1");
        assert!(raw.error.is_none());
    }

    #[test]
    fn test_status_falls_back_to_single_url_and_error() {
        let data: TaskData = serde_json::from_value(serde_json::json!({
            "task_id": "t1",
            "status": "failed",
            "output": { "image_url": "https://cdn.example.com/grid.png" },
            "error": { "code": 10000, "message": "banned prompt" }
        }))
        .unwrap();
        let raw = raw_status_from(data);
        assert_eq!(raw.output_urls, vec!["https://cdn.example.com/grid.png".to_string()]);
        assert_eq!(raw.error.as_deref(), Some("banned prompt"));
    }
}
