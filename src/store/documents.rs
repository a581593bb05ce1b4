// src/store/documents.rs
//! Shapes of the JSON documents shared between processes.
//!
//! Every struct is `#[serde(default)]` so that documents written by older or
//! partially-initialized runs still parse; missing fields take their defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Pipeline run ("public config").
pub const PUBLIC_DOC: &str = "config/config_public.json";
/// Wrapper around the active generation task.
pub const ACTIVE_TASK_DOC: &str = "config/config_midjourney.json";
/// Poll bookkeeping for the active task.
pub const FETCH_DOC: &str = "config/config_fetch.json";

/// Documents carrying a monotonic write counter.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! impl_versioned {
    ($($ty:ty),*) => {
        $(impl Versioned for $ty {
            fn version(&self) -> u64 {
                self.version
            }
            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        })*
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSlot {
    Primary,
    Fallback,
}

impl ProviderSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderSlot::Primary => "primary",
            ProviderSlot::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Which media a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Image,
    Video,
}

/// What was asked of the provider. Kept on the task so a fallback can be
/// submitted with the same prompt context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationRequest {
    /// Text prompt to first-frame image.
    Imagine { prompt: String },
    /// First-frame image plus motion prompt to video.
    Animate { prompt: String, image_url: String },
    /// Follow-up operation on a finished task (e.g. `upscale1`).
    Action { parent_task_id: String, action: String },
}

impl GenerationRequest {
    pub fn stage(&self) -> TaskStage {
        match self {
            GenerationRequest::Imagine { .. } | GenerationRequest::Action { .. } => TaskStage::Image,
            GenerationRequest::Animate { .. } => TaskStage::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: String,
    pub provider: ProviderSlot,
    pub request: GenerationRequest,
    /// Local clock at send time, never a provider timestamp.
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub status: TaskStatus,
}

impl GenerationTask {
    pub fn stage(&self) -> TaskStage {
        self.request.stage()
    }
}

/// One-shot record of an escalation, written in the same save that clears the
/// exhausted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationMarker {
    pub from_task_id: String,
    /// `None` when the task was abandoned rather than handed to a fallback.
    pub to_provider: Option<ProviderSlot>,
    pub at: DateTime<Utc>,
}

/// `config/config_midjourney.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveTaskDoc {
    pub task: Option<GenerationTask>,
    pub last_escalation: Option<EscalationMarker>,
    pub version: u64,
}

impl ActiveTaskDoc {
    pub fn active_task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|t| t.task_id.as_str())
    }

    pub fn has_live_task(&self) -> bool {
        self.task.as_ref().map(|t| !t.status.is_terminal()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOutcome {
    Completed,
    Failed,
    Abandoned,
}

/// Terminal outcome of the most recent task, as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    pub task_id: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_urls: Vec<String>,
    #[serde(default = "default_outcome")]
    pub outcome: ResultOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set once media has been archived and the next stage triggered.
    #[serde(default)]
    pub finalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

fn default_outcome() -> ResultOutcome {
    ResultOutcome::Completed
}

impl TaskResults {
    pub fn completed(task: &GenerationTask, urls: Vec<String>, now: DateTime<Utc>) -> Self {
        let (image_urls, video_urls) = match task.stage() {
            TaskStage::Image => (urls, Vec::new()),
            TaskStage::Video => (Vec::new(), urls),
        };
        Self {
            task_id: task.task_id.clone(),
            image_urls,
            video_urls,
            outcome: ResultOutcome::Completed,
            stage: Some(task.stage()),
            provider: Some(task.provider),
            error: None,
            finalized: false,
            recorded_at: Some(now),
        }
    }

    pub fn unsuccessful(
        task: &GenerationTask,
        outcome: ResultOutcome,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            image_urls: Vec::new(),
            video_urls: Vec::new(),
            outcome,
            stage: Some(task.stage()),
            provider: Some(task.provider),
            error: Some(error.into()),
            finalized: false,
            recorded_at: Some(now),
        }
    }

    /// The output URLs for whichever stage produced this result.
    pub fn output_urls(&self) -> &[String] {
        match self.stage {
            Some(TaskStage::Video) => &self.video_urls,
            _ => &self.image_urls,
        }
    }

    pub fn awaiting_finalize(&self) -> bool {
        self.outcome == ResultOutcome::Completed && !self.finalized
    }
}

/// `config/config_public.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineRun {
    pub publish_list: Vec<String>,
    pub empty_folders: BTreeSet<String>,
    /// Advisory: a finalize step is in flight. Not enforced by the store.
    pub processing_lock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_lock_since: Option<DateTime<Utc>>,
    pub results: Option<TaskResults>,
    pub version: u64,
}

/// `config/config_fetch.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchState {
    pub done: bool,
    pub fetch_attempts: u32,
    /// Task this bookkeeping belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub version: u64,
}

impl FetchState {
    pub fn for_task(task_id: &str) -> Self {
        Self {
            done: false,
            fetch_attempts: 0,
            task_id: Some(task_id.to_string()),
            version: 0,
        }
    }

    /// The two documents are saved separately, so a crash can leave a
    /// FetchState describing an older task. Anything not tagged with the
    /// active task reads as freshly reset.
    pub fn belonging_to(&self, active_task_id: Option<&str>) -> FetchState {
        match (active_task_id, self.task_id.as_deref()) {
            (Some(active), Some(own)) if active == own => self.clone(),
            (Some(active), _) => FetchState {
                version: self.version,
                ..FetchState::for_task(active)
            },
            (None, _) => self.clone(),
        }
    }
}

impl_versioned!(PipelineRun, ActiveTaskDoc, FetchState);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_public_doc_fills_defaults() {
        let run: PipelineRun = serde_json::from_str(r#"{"publish_list": ["a"]}"#).unwrap();
        assert_eq!(run.publish_list, vec!["a".to_string()]);
        assert!(!run.processing_lock);
        assert!(run.results.is_none());
        assert_eq!(run.version, 0);
    }

    #[test]
    fn test_results_without_outcome_read_as_completed() {
        let results: TaskResults =
            serde_json::from_str(r#"{"task_id": "t1", "image_urls": ["u"]}"#).unwrap();
        assert_eq!(results.outcome, ResultOutcome::Completed);
        assert_eq!(results.output_urls(), ["u".to_string()]);
        assert!(results.awaiting_finalize());
    }

    #[test]
    fn test_request_is_tagged() {
        let request = GenerationRequest::Animate {
            prompt: "slow pan".to_string(),
            image_url: "https://cdn.example.com/a.png".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "animate");
        assert_eq!(request.stage(), TaskStage::Video);
    }

    #[test]
    fn test_fetch_state_for_other_task_reads_as_reset() {
        let stale = FetchState {
            done: true,
            fetch_attempts: 4,
            task_id: Some("old".to_string()),
            version: 7,
        };
        let view = stale.belonging_to(Some("new"));
        assert!(!view.done);
        assert_eq!(view.fetch_attempts, 0);
        assert_eq!(view.task_id.as_deref(), Some("new"));
        assert_eq!(view.version, 7);

        assert_eq!(stale.belonging_to(Some("old")), stale);
    }
}
