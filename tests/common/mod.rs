//! Fakes shared by the integration tests: scripted providers, a recording
//! stage launcher, canned media downloads, all on one in-memory bucket.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genpipe::coordinator::finalize::{FetchedMedia, MediaFetcher};
use genpipe::coordinator::stage::{LaunchError, Stage, StageLauncher};
use genpipe::coordinator::{Coordinator, CoordinatorSettings};
use genpipe::escalation::EscalationPolicy;
use genpipe::providers::status::{StatusVocabulary, MIDJOURNEY};
use genpipe::providers::{GenerationProvider, ProviderSet, RawStatus, SubmitError};
use genpipe::store::backend::{MemoryStore, ObjectStore};
use genpipe::store::documents::{
    ActiveTaskDoc, GenerationRequest, GenerationTask, ProviderSlot, TaskStatus, ACTIVE_TASK_DOC,
};
use genpipe::store::{StateStore, StoreError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "hook-secret";

pub struct ScriptedProvider {
    name: &'static str,
    submits: Mutex<VecDeque<Result<String, SubmitError>>>,
    statuses: Mutex<VecDeque<Result<RawStatus, String>>>,
    pub submitted: Mutex<Vec<GenerationRequest>>,
    pub status_calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            submits: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            status_calls: AtomicU32::new(0),
        }
    }

    pub fn will_submit(&self, result: Result<String, SubmitError>) {
        self.submits.lock().unwrap().push_back(result);
    }

    pub fn will_report(&self, result: Result<RawStatus, String>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    pub fn submissions(&self) -> Vec<GenerationRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn vocabulary(&self) -> &'static StatusVocabulary {
        &MIDJOURNEY
    }

    async fn create_task(&self, request: &GenerationRequest) -> Result<String, SubmitError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        let n = submitted.len();
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}-task-{}", self.name, n)))
    }

    async fn fetch_status(&self, _task_id: &str) -> Result<RawStatus, String> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(RawStatus {
                status: "pending".to_string(),
                ..Default::default()
            })
        })
    }
}

pub fn pending() -> Result<RawStatus, String> {
    Ok(RawStatus {
        status: "pending".to_string(),
        ..Default::default()
    })
}

pub fn completed(urls: &[&str]) -> Result<RawStatus, String> {
    Ok(RawStatus {
        status: "completed".to_string(),
        output_urls: urls.iter().map(|u| u.to_string()).collect(),
        ..Default::default()
    })
}

#[derive(Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<(Stage, Option<String>)>>,
    fail_next: AtomicBool,
}

impl RecordingLauncher {
    pub fn launches(&self) -> Vec<(Stage, Option<String>)> {
        self.launches.lock().unwrap().clone()
    }

    /// The next launch fails to spawn and is not recorded.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageLauncher for RecordingLauncher {
    async fn launch(&self, stage: Stage, folder: Option<&str>) -> Result<(), LaunchError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::Spawn {
                stage,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "sh: not found"),
            });
        }
        self.launches
            .lock()
            .unwrap()
            .push((stage, folder.map(str::to_string)));
        Ok(())
    }
}

/// Any URL downloads as a small PNG unless it contains `missing`. Each
/// download takes `delay`.
#[derive(Default)]
pub struct CannedMedia {
    pub delay: Duration,
}

#[async_trait]
impl MediaFetcher for CannedMedia {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if url.contains("missing") {
            return Err("404 Not Found".to_string());
        }
        Ok(FetchedMedia {
            bytes: vec![0x89, b'P', b'N', b'G'],
            content_type: Some("image/png".to_string()),
        })
    }
}

/// Bucket whose media writes fail; documents still work.
pub struct BrokenMediaBucket(pub Arc<MemoryStore>);

#[async_trait]
impl ObjectStore for BrokenMediaBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.0.get(key).await
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if key.starts_with("media/") {
            return Err(StoreError::Backend {
                status: 503,
                message: "bucket unavailable".to_string(),
            });
        }
        self.0.put(key, body, content_type).await
    }
}

pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub store: StateStore,
    pub primary: Arc<ScriptedProvider>,
    pub fallback: Arc<ScriptedProvider>,
    pub launcher: Arc<RecordingLauncher>,
    pub media: Arc<CannedMedia>,
    pub coordinator: Coordinator,
    settings: CoordinatorSettings,
    _scratch: tempfile::TempDir,
}

#[derive(Default)]
pub struct HarnessOptions {
    pub fallback_enabled: bool,
    pub auto_upscale_action: Option<String>,
    pub broken_media_bucket: bool,
    pub media_delay: Duration,
}

pub fn default_policy() -> EscalationPolicy {
    EscalationPolicy::new(
        [60, 120, 180, 300, 600].iter().map(|s| Duration::from_secs(*s)).collect(),
        5,
    )
    .unwrap()
}

fn coordinator_for(
    store: &StateStore,
    primary: &Arc<ScriptedProvider>,
    fallback: &Arc<ScriptedProvider>,
    launcher: &Arc<RecordingLauncher>,
    media: &Arc<CannedMedia>,
    settings: &CoordinatorSettings,
) -> Coordinator {
    let providers = ProviderSet {
        primary: Some(primary.clone() as Arc<dyn GenerationProvider>),
        fallback: Some(fallback.clone() as Arc<dyn GenerationProvider>),
        video: None,
    };
    Coordinator::new(
        store.clone(),
        providers,
        default_policy(),
        launcher.clone(),
        media.clone(),
        settings.clone(),
    )
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::new());
        let backend: Arc<dyn ObjectStore> = if options.broken_media_bucket {
            Arc::new(BrokenMediaBucket(memory.clone()))
        } else {
            memory.clone() as Arc<dyn ObjectStore>
        };
        let store = StateStore::new(backend, scratch.path());

        let primary = Arc::new(ScriptedProvider::new("primary"));
        let fallback = Arc::new(ScriptedProvider::new("fallback"));
        let launcher = Arc::new(RecordingLauncher::default());
        let media = Arc::new(CannedMedia {
            delay: options.media_delay,
        });
        let settings = CoordinatorSettings {
            fallback_enabled: options.fallback_enabled,
            auto_upscale_action: options.auto_upscale_action,
            ..Default::default()
        };
        let coordinator = coordinator_for(&store, &primary, &fallback, &launcher, &media, &settings);

        Self {
            memory,
            store,
            primary,
            fallback,
            launcher,
            media,
            coordinator,
            settings,
            _scratch: scratch,
        }
    }

    /// Another process talking to the same bucket and providers.
    pub fn another_process(&self) -> Coordinator {
        coordinator_for(
            &self.store,
            &self.primary,
            &self.fallback,
            &self.launcher,
            &self.media,
            &self.settings,
        )
    }

    /// Make `task_id` the active primary image task.
    pub async fn seed_task(&self, task_id: &str, submitted_at: DateTime<Utc>, attempts: u32) {
        let doc = ActiveTaskDoc {
            task: Some(GenerationTask {
                task_id: task_id.to_string(),
                provider: ProviderSlot::Primary,
                request: GenerationRequest::Imagine {
                    prompt: "a lighthouse in fog".to_string(),
                },
                submitted_at,
                attempts,
                status: if attempts == 0 {
                    TaskStatus::Pending
                } else {
                    TaskStatus::InProgress
                },
            }),
            last_escalation: None,
            version: 0,
        };
        self.store.save(ACTIVE_TASK_DOC, &doc).await.unwrap();
    }
}

pub fn seconds_ago(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    now - chrono::Duration::seconds(secs)
}
