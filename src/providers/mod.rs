// src/providers/mod.rs
//! External generation providers: submit a task, poll its status.
//!
//! Provider clients only speak their own wire format. Everything that should
//! behave the same across providers (local submission timestamps, retry of
//! transient submit errors, status normalization, swallowing poll failures)
//! lives in `TaskSubmitter` and `StatusPoller`.

pub mod fallback;
pub mod midjourney;
pub mod status;
pub mod video;

use crate::config::PipelineConfig;
use crate::store::documents::{GenerationRequest, ProviderSlot, TaskStage};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use status::{NormalizedStatus, StatusVocabulary};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// Bad or missing credentials. Retrying will not help.
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    /// Back off and submit again on a later invocation; do not poll.
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),
    /// The prompt itself was refused. Fatal for this run, needs an operator.
    #[error("provider rejected the prompt: {0}")]
    PromptRejected(String),
    #[error("network error talking to provider: {0}")]
    Network(String),
    #[error("no provider configured for {stage:?} on the {slot:?} slot")]
    Unavailable { slot: ProviderSlot, stage: TaskStage },
    #[error("provider does not support this request: {0}")]
    Unsupported(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Network(_))
    }
}

/// Raw status as reported by a provider, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStatus {
    pub status: String,
    pub output_urls: Vec<String>,
    pub actions: Vec<String>,
    pub error: Option<String>,
}

/// Normalized status of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: NormalizedStatus,
    pub output_urls: Vec<String>,
    /// Follow-up operations the provider offers (e.g. `upscale1`).
    pub actions: Vec<String>,
    pub error: Option<String>,
}

impl StatusReport {
    pub fn completed(output_urls: Vec<String>) -> Self {
        Self {
            status: NormalizedStatus::Completed,
            output_urls,
            actions: Vec::new(),
            error: None,
        }
    }

    pub fn in_progress() -> Self {
        Self {
            status: NormalizedStatus::InProgress,
            output_urls: Vec::new(),
            actions: Vec::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NormalizedStatus::Failed,
            output_urls: Vec::new(),
            actions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Opaque handle on one outstanding job.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub task_id: String,
    pub provider: ProviderSlot,
    pub submitted_at: DateTime<Utc>,
}

/// One provider's wire protocol.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn vocabulary(&self) -> &'static StatusVocabulary;

    /// Create a task and return the provider's task id.
    async fn create_task(&self, request: &GenerationRequest) -> Result<String, SubmitError>;

    /// Fetch the current raw status. Any `Err` is treated as "no answer".
    async fn fetch_status(&self, task_id: &str) -> Result<RawStatus, String>;
}

/// Configured providers, looked up by slot and stage.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub primary: Option<Arc<dyn GenerationProvider>>,
    pub fallback: Option<Arc<dyn GenerationProvider>>,
    pub video: Option<Arc<dyn GenerationProvider>>,
}

impl ProviderSet {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, SubmitError> {
        let mut set = ProviderSet::default();
        if let Some(settings) = &config.primary {
            set.primary = Some(Arc::new(midjourney::MidjourneyClient::new(
                settings,
                &config.params,
                config.status_timeout,
            )?));
        }
        if let Some(settings) = &config.fallback {
            set.fallback = Some(Arc::new(fallback::FallbackImageClient::new(
                settings,
                &config.params,
                config.status_timeout,
            )?));
        }
        if let Some(settings) = &config.video {
            set.video = Some(Arc::new(video::VideoClient::new(
                settings,
                &config.params,
                config.status_timeout,
            )?));
        }
        Ok(set)
    }

    pub fn get(&self, slot: ProviderSlot, stage: TaskStage) -> Option<&Arc<dyn GenerationProvider>> {
        match (slot, stage) {
            (ProviderSlot::Primary, TaskStage::Image) => self.primary.as_ref(),
            (ProviderSlot::Fallback, TaskStage::Image) => self.fallback.as_ref(),
            (ProviderSlot::Primary, TaskStage::Video) => self.video.as_ref(),
            (ProviderSlot::Fallback, TaskStage::Video) => None,
        }
    }

    pub fn configured(&self) -> Vec<&'static str> {
        [&self.primary, &self.fallback, &self.video]
            .into_iter()
            .flatten()
            .map(|p| p.name())
            .collect()
    }
}

/// Submits requests, retrying transient network errors within a bounded budget.
#[derive(Clone)]
pub struct TaskSubmitter {
    providers: ProviderSet,
    retry_budget: Duration,
}

impl TaskSubmitter {
    pub fn new(providers: ProviderSet, retry_budget: Duration) -> Self {
        Self {
            providers,
            retry_budget,
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub async fn submit(
        &self,
        request: &GenerationRequest,
        slot: ProviderSlot,
    ) -> Result<TaskHandle, SubmitError> {
        let stage = request.stage();
        let provider = self
            .providers
            .get(slot, stage)
            .ok_or(SubmitError::Unavailable { slot, stage })?;

        let submitted_at = Utc::now();

        let backoff_config = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            multiplier: 2.0,
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        let provider: &dyn GenerationProvider = provider.as_ref();
        let operation = || async move {
            provider.create_task(request).await.map_err(|e| {
                if e.is_retryable() {
                    tracing::warn!(provider = provider.name(), error = %e, "submit failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        };

        let task_id = retry(backoff_config, operation).await.map_err(|e| {
            tracing::error!(provider = provider.name(), error = %e, "submit failed");
            e
        })?;

        tracing::info!(
            task_id = %task_id,
            provider = provider.name(),
            slot = slot.as_str(),
            "🎬 generation task submitted"
        );

        Ok(TaskHandle {
            task_id,
            provider: slot,
            submitted_at,
        })
    }
}

/// Polls providers and normalizes what they say.
pub struct StatusPoller {
    providers: ProviderSet,
    misses: AtomicU32,
}

impl StatusPoller {
    pub fn new(providers: ProviderSet) -> Self {
        Self {
            providers,
            misses: AtomicU32::new(0),
        }
    }

    /// `None` means "no answer this time" (network or parse failure). It is
    /// not a failure of the task and must not advance its attempt count.
    pub async fn poll(
        &self,
        task_id: &str,
        slot: ProviderSlot,
        stage: TaskStage,
    ) -> Option<StatusReport> {
        let Some(provider) = self.providers.get(slot, stage) else {
            tracing::error!(task_id, slot = slot.as_str(), "no provider configured to poll this task");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match provider.fetch_status(task_id).await {
            Ok(raw) => {
                let status = provider.vocabulary().normalize(&raw.status);
                tracing::debug!(task_id, raw = %raw.status, ?status, "polled task status");
                Some(StatusReport {
                    status,
                    output_urls: raw.output_urls,
                    actions: raw.actions,
                    error: raw.error,
                })
            }
            Err(e) => {
                let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(task_id, provider = provider.name(), misses, error = %e, "status poll got no answer");
                None
            }
        }
    }

    /// Polls in this process that got no answer.
    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Map a non-success submit response onto the submit error taxonomy.
pub(crate) fn classify_submit_failure(status: StatusCode, body: String) -> SubmitError {
    match status.as_u16() {
        401 | 403 => SubmitError::Auth(format!("{}: {}", status, body)),
        429 => SubmitError::RateLimited(format!("{}: {}", status, body)),
        400 | 413 | 422 => SubmitError::PromptRejected(format!("{}: {}", status, body)),
        _ => SubmitError::Network(format!("{}: {}", status, body)),
    }
}

/// Map a transport-level failure. Timeouts count as network errors.
pub(crate) fn classify_transport_failure(error: reqwest::Error) -> SubmitError {
    SubmitError::Network(error.to_string())
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, SubmitError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SubmitError::Network(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedProvider {
        submits: Mutex<Vec<Result<String, SubmitError>>>,
        statuses: Mutex<Vec<Result<RawStatus, String>>>,
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn vocabulary(&self) -> &'static StatusVocabulary {
            &status::MIDJOURNEY
        }

        async fn create_task(&self, _request: &GenerationRequest) -> Result<String, SubmitError> {
            self.submits.lock().unwrap().remove(0)
        }

        async fn fetch_status(&self, _task_id: &str) -> Result<RawStatus, String> {
            self.statuses.lock().unwrap().remove(0)
        }
    }

    fn set_with(provider: ScriptedProvider) -> ProviderSet {
        ProviderSet {
            primary: Some(Arc::new(provider)),
            ..Default::default()
        }
    }

    fn imagine() -> GenerationRequest {
        GenerationRequest::Imagine {
            prompt: "a lighthouse at dawn".to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_stamps_local_time() {
        let submitter = TaskSubmitter::new(
            set_with(ScriptedProvider {
                submits: Mutex::new(vec![Ok("task-1".to_string())]),
                statuses: Mutex::new(vec![]),
            }),
            Duration::ZERO,
        );
        let before = Utc::now();
        let handle = submitter.submit(&imagine(), ProviderSlot::Primary).await.unwrap();
        assert_eq!(handle.task_id, "task-1");
        assert_eq!(handle.provider, ProviderSlot::Primary);
        assert!(handle.submitted_at >= before && handle.submitted_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let submitter = TaskSubmitter::new(
            set_with(ScriptedProvider {
                submits: Mutex::new(vec![
                    Err(SubmitError::Auth("401".to_string())),
                    Ok("never".to_string()),
                ]),
                statuses: Mutex::new(vec![]),
            }),
            Duration::from_secs(30),
        );
        let err = submitter.submit(&imagine(), ProviderSlot::Primary).await.unwrap_err();
        assert_eq!(err, SubmitError::Auth("401".to_string()));
    }

    #[tokio::test]
    async fn test_missing_slot_is_unavailable() {
        let submitter = TaskSubmitter::new(ProviderSet::default(), Duration::ZERO);
        let err = submitter.submit(&imagine(), ProviderSlot::Fallback).await.unwrap_err();
        assert!(matches!(err, SubmitError::Unavailable { slot: ProviderSlot::Fallback, .. }));
    }

    #[tokio::test]
    async fn test_poll_failure_is_a_soft_miss() {
        let poller = StatusPoller::new(set_with(ScriptedProvider {
            submits: Mutex::new(vec![]),
            statuses: Mutex::new(vec![
                Err("timeout".to_string()),
                Ok(RawStatus {
                    status: "Completed".to_string(),
                    output_urls: vec!["https://cdn.example.com/1.png".to_string()],
                    ..Default::default()
                }),
            ]),
        }));

        assert!(poller.poll("t", ProviderSlot::Primary, TaskStage::Image).await.is_none());
        assert_eq!(poller.misses(), 1);

        let report = poller.poll("t", ProviderSlot::Primary, TaskStage::Image).await.unwrap();
        assert_eq!(report.status, NormalizedStatus::Completed);
        assert_eq!(report.output_urls.len(), 1);
        assert_eq!(poller.misses(), 1);
    }

    #[test]
    fn test_submit_failure_classification() {
        assert!(matches!(
            classify_submit_failure(StatusCode::UNAUTHORIZED, String::new()),
            SubmitError::Auth(_)
        ));
        assert!(matches!(
            classify_submit_failure(StatusCode::TOO_MANY_REQUESTS, String::new()),
            SubmitError::RateLimited(_)
        ));
        assert!(matches!(
            classify_submit_failure(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            SubmitError::PromptRejected(_)
        ));
        assert!(classify_submit_failure(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
    }
}
