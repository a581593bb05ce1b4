// src/coordinator/mod.rs
//! Runs pipeline transitions against the real world: loads the documents,
//! applies a pure transition from `state`, writes back what changed, then
//! executes the resulting intents.
//!
//! Every public entry point is a complete read-modify-write cycle. Runners and
//! the webhook server call these concurrently from separate processes; the
//! only coordination between them is the document versions and the advisory
//! processing lock.

pub mod finalize;
pub mod stage;
pub mod state;

use crate::config::{ConfigError, PipelineConfig};
use crate::escalation::{Decision, EscalationPolicy};
use crate::providers::{ProviderSet, StatusPoller, StatusReport, SubmitError, TaskHandle, TaskSubmitter};
use crate::store::documents::{
    ActiveTaskDoc, FetchState, GenerationRequest, GenerationTask, PipelineRun, ProviderSlot,
    ACTIVE_TASK_DOC, FETCH_DOC, PUBLIC_DOC,
};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use finalize::{archive_outputs, folder_for, HttpMediaFetcher, MediaFetcher};
use stage::{CommandLauncher, LaunchError, Stage, StageLauncher};
use state::{FinalizeGate, Intent, Outcome, PipelineState, TaskEvent, TransitionContext};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("task {0} is still active")]
    TaskActive(String),
    #[error("media client unavailable: {0}")]
    Media(String),
    #[error("finalize task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CoordinatorError {
    /// Runner exit status. Transient provider trouble is left for the next
    /// scheduled invocation and does not fail the run.
    pub fn exit_code(&self) -> u8 {
        match self {
            CoordinatorError::TaskActive(_) => 0,
            CoordinatorError::Submit(e) if e.is_retryable() => 0,
            CoordinatorError::Submit(SubmitError::RateLimited(_)) => 0,
            CoordinatorError::Submit(SubmitError::PromptRejected(_))
            | CoordinatorError::Submit(SubmitError::Unsupported(_)) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub fallback_enabled: bool,
    pub auto_upscale_action: Option<String>,
    pub lock_stale_after: Duration,
    pub submit_retry_budget: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fallback_enabled: false,
            auto_upscale_action: None,
            lock_stale_after: Duration::from_secs(1800),
            submit_retry_budget: Duration::ZERO,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            fallback_enabled: config.fallback_enabled,
            auto_upscale_action: config.auto_upscale_action.clone(),
            lock_stale_after: config.processing_lock_stale_after,
            submit_retry_budget: config.submit_retry_budget,
        }
    }
}

/// What one poll cycle did with the active task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Idle,
    /// Too early to poll; next poll due once `until` has elapsed.
    Waiting { until: Duration },
    /// The provider did not answer. Nothing was written.
    NoAnswer,
    Advanced(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    NothingToDo,
    Deferred,
    Finalized {
        folder: String,
        archived: usize,
        next_stage: Option<Stage>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Finalize left over from an earlier deferral, run before polling.
    pub deferred_finalize: FinalizeOutcome,
    pub poll: PollOutcome,
}

pub struct Coordinator {
    store: StateStore,
    submitter: TaskSubmitter,
    poller: StatusPoller,
    policy: EscalationPolicy,
    launcher: Arc<dyn StageLauncher>,
    media: Arc<dyn MediaFetcher>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        store: StateStore,
        providers: ProviderSet,
        policy: EscalationPolicy,
        launcher: Arc<dyn StageLauncher>,
        media: Arc<dyn MediaFetcher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            submitter: TaskSubmitter::new(providers.clone(), settings.submit_retry_budget),
            poller: StatusPoller::new(providers),
            policy,
            launcher,
            media,
            settings,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, CoordinatorError> {
        let store = StateStore::from_settings(&config.store)?;
        let providers = ProviderSet::from_config(config)?;
        let policy = EscalationPolicy::from_config(config)?;
        let launcher = Arc::new(CommandLauncher::new(config.stage_commands.clone()));
        let media = Arc::new(HttpMediaFetcher::new(config.media_timeout).map_err(CoordinatorError::Media)?);
        Ok(Self::new(
            store,
            providers,
            policy,
            launcher,
            media,
            CoordinatorSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn providers(&self) -> &ProviderSet {
        self.submitter.providers()
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn poll_misses(&self) -> u32 {
        self.poller.misses()
    }

    pub async fn load_state(&self) -> Result<PipelineState, StoreError> {
        load_documents(&self.store).await
    }

    async fn commit(&self, before: &PipelineState, after: PipelineState) -> Result<PipelineState, StoreError> {
        commit_documents(&self.store, before, after).await
    }

    fn context(&self, now: DateTime<Utc>) -> TransitionContext<'_> {
        TransitionContext {
            now,
            policy: &self.policy,
            fallback_available: self.settings.fallback_enabled
                && self.providers().fallback.is_some(),
            auto_upscale_action: self.settings.auto_upscale_action.as_deref(),
        }
    }

    /// Submit a new task to the primary slot for its stage and make it active.
    pub async fn submit(&self, request: GenerationRequest) -> Result<TaskHandle, CoordinatorError> {
        let before = self.load_state().await?;
        if let Some(task) = before.active.task.as_ref().filter(|t| !t.status.is_terminal()) {
            return Err(CoordinatorError::TaskActive(task.task_id.clone()));
        }

        let handle = self.submitter.submit(&request, ProviderSlot::Primary).await?;
        self.adopt(handle.clone(), request).await?;
        Ok(handle)
    }

    /// Record a submitted task. Reloads first: submission can take a while.
    async fn adopt(&self, handle: TaskHandle, request: GenerationRequest) -> Result<(), CoordinatorError> {
        let before = self.load_state().await?;
        match state::record_submission(before.clone(), &handle, request) {
            Ok(after) => {
                self.commit(&before, after).await?;
                Ok(())
            }
            Err(rejected) => {
                error!(
                    task_id = %handle.task_id,
                    active_task_id = %rejected.active_task_id,
                    "another task became active during submission, new task will not be tracked"
                );
                Err(CoordinatorError::TaskActive(rejected.active_task_id))
            }
        }
    }

    /// One runner invocation: finish any deferred finalize, then decide what to
    /// do about the active task.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<CycleReport, CoordinatorError> {
        let deferred_finalize = self.finalize(now).await?;

        let before = self.load_state().await?;
        let Some(task) = before.active.task.clone() else {
            return Ok(CycleReport {
                deferred_finalize,
                poll: PollOutcome::Idle,
            });
        };

        let event = match self.policy.decide_at(task.submitted_at, now, task.attempts) {
            Decision::Wait { until } => {
                info!(task_id = %task.task_id, wait_until_secs = until.as_secs(), "⏳ not yet due for a poll");
                return Ok(CycleReport {
                    deferred_finalize,
                    poll: PollOutcome::Waiting { until },
                });
            }
            Decision::Escalate => TaskEvent::Exhausted,
            Decision::PollNow => {
                let Some(report) = self
                    .poller
                    .poll(&task.task_id, task.provider, task.stage())
                    .await
                else {
                    return Ok(CycleReport {
                        deferred_finalize,
                        poll: PollOutcome::NoAnswer,
                    });
                };
                TaskEvent::Observed {
                    task_id: task.task_id.clone(),
                    report,
                }
            }
        };

        let outcome = self.apply(before, event, now).await?;
        Ok(CycleReport {
            deferred_finalize,
            poll: PollOutcome::Advanced(outcome),
        })
    }

    /// Feed a pushed status report through the same routine the poller uses.
    pub async fn handle_report(
        &self,
        task_id: &str,
        report: StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoordinatorError> {
        let before = self.load_state().await?;
        let event = TaskEvent::Observed {
            task_id: task_id.to_string(),
            report,
        };
        self.apply(before, event, now).await
    }

    async fn apply(
        &self,
        before: PipelineState,
        event: TaskEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoordinatorError> {
        let transition = state::advance(before.clone(), event, &self.context(now));
        if transition.outcome != Outcome::Ignored {
            self.commit(&before, transition.state).await?;
        }
        for intent in transition.intents {
            self.execute(intent, now).await?;
        }
        Ok(transition.outcome)
    }

    async fn execute(&self, intent: Intent, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        match intent {
            Intent::Finalize { task_id } => {
                let outcome = self.finalize(now).await?;
                info!(task_id = %task_id, ?outcome, "finalize step done");
                Ok(())
            }
            Intent::SubmitFallback { retired } => {
                let request = retired.request.clone();
                self.submit_replacement(&retired, request, ProviderSlot::Fallback, now)
                    .await
            }
            Intent::SubmitAction { parent, action } => {
                let request = GenerationRequest::Action {
                    parent_task_id: parent.task_id.clone(),
                    action,
                };
                self.submit_replacement(&parent, request, ProviderSlot::Primary, now)
                    .await
            }
            Intent::RunStage { stage, folder } => self.launch(stage, folder.as_deref()).await,
        }
    }

    /// Submit the task that replaces `retired`. The retired task has already
    /// been cleared, so a failure here is recorded as its final result rather
    /// than retried.
    async fn submit_replacement(
        &self,
        retired: &GenerationTask,
        request: GenerationRequest,
        slot: ProviderSlot,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        match self.submitter.submit(&request, slot).await {
            Ok(handle) => {
                info!(
                    from_task_id = %retired.task_id,
                    task_id = %handle.task_id,
                    slot = slot.as_str(),
                    "replacement task submitted"
                );
                self.adopt(handle, request).await
            }
            Err(e) => {
                error!(from_task_id = %retired.task_id, error = %e, "replacement submission failed");
                let before = self.load_state().await?;
                let after = state::record_lost_submission(before.clone(), retired, &e.to_string(), now);
                self.commit(&before, after).await?;
                Ok(())
            }
        }
    }

    async fn launch(&self, stage: Stage, folder: Option<&str>) -> Result<(), CoordinatorError> {
        launch_stage(self.launcher.as_ref(), stage, folder).await
    }

    /// Archive the current results and trigger the next stage, unless another
    /// process holds the processing lock.
    ///
    /// Once the lock is taken the rest runs as a spawned task, so dropping this
    /// future (request timeout, client hang-up) never leaves the lock held.
    pub async fn finalize(&self, now: DateTime<Utc>) -> Result<FinalizeOutcome, CoordinatorError> {
        let before = self.load_state().await?;
        let mut locked = before.clone();
        let task_id = match state::begin_finalize(&mut locked.run, now, self.settings.lock_stale_after) {
            FinalizeGate::NothingToDo => return Ok(FinalizeOutcome::NothingToDo),
            FinalizeGate::Deferred => return Ok(FinalizeOutcome::Deferred),
            FinalizeGate::Proceed { task_id } => task_id,
        };
        let urls = locked
            .run
            .results
            .as_ref()
            .map(|r| r.output_urls().to_vec())
            .unwrap_or_default();
        self.commit(&before, locked).await?;
        info!(task_id = %task_id, outputs = urls.len(), "🔒 processing lock taken, archiving outputs");

        let job = ArchiveJob {
            store: self.store.clone(),
            media: self.media.clone(),
            launcher: self.launcher.clone(),
            task_id,
            urls,
        };
        tokio::spawn(job.run()).await?
    }

    /// Pop the next folder off the publish queue and launch the publish stage.
    pub async fn take_next_publish(&self) -> Result<Option<String>, CoordinatorError> {
        let before = self.load_state().await?;
        let mut after = before.clone();
        let Some(Intent::RunStage { stage, folder }) = state::take_next_publish(&mut after.run) else {
            return Ok(None);
        };
        self.commit(&before, after).await?;

        if let Err(e) = self.launch(stage, folder.as_deref()).await {
            // Put the folder back at the front so the next run retries it.
            let before = self.load_state().await?;
            let mut after = before.clone();
            if let Some(folder) = &folder {
                after.run.publish_list.insert(0, folder.clone());
            }
            self.commit(&before, after).await?;
            return Err(e);
        }
        Ok(folder)
    }
}

/// The part of a finalize that runs while holding the processing lock.
struct ArchiveJob {
    store: StateStore,
    media: Arc<dyn MediaFetcher>,
    launcher: Arc<dyn StageLauncher>,
    task_id: String,
    urls: Vec<String>,
}

impl ArchiveJob {
    async fn run(self) -> Result<FinalizeOutcome, CoordinatorError> {
        let archive = archive_outputs(
            self.store.backend().as_ref(),
            self.media.as_ref(),
            &self.task_id,
            &self.urls,
        )
        .await;

        // Reload: other processes may have touched the run while we downloaded.
        let reloaded = load_documents(&self.store).await?;
        let archive = match archive {
            Ok(report) => report,
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    folder = %folder_for(&self.task_id),
                    error = %e,
                    "archiving failed, releasing processing lock"
                );
                self.release(&reloaded).await?;
                return Err(e.into());
            }
        };

        let mut finished = reloaded.clone();
        let intent = state::end_finalize(&mut finished.run, &self.task_id, &archive.folder, archive.archived);

        // The results are only marked finalized once the next stage started.
        let next_stage = match intent {
            Some(Intent::RunStage { stage, folder }) => {
                if let Err(e) = launch_stage(self.launcher.as_ref(), stage, folder.as_deref()).await {
                    error!(
                        task_id = %self.task_id,
                        stage = stage.as_str(),
                        error = %e,
                        "next stage did not start, finalize left for the next cycle"
                    );
                    self.release(&reloaded).await?;
                    return Err(e);
                }
                Some(stage)
            }
            _ => None,
        };

        commit_documents(&self.store, &reloaded, finished).await?;
        info!(
            task_id = %self.task_id,
            folder = %archive.folder,
            archived = archive.archived,
            skipped = archive.skipped,
            "🔓 finalize complete"
        );

        Ok(FinalizeOutcome::Finalized {
            folder: archive.folder,
            archived: archive.archived,
            next_stage,
        })
    }

    /// Drop the lock and leave the results unfinalized.
    async fn release(&self, reloaded: &PipelineState) -> Result<(), StoreError> {
        let mut released = reloaded.clone();
        released.run.processing_lock = false;
        released.run.processing_lock_since = None;
        commit_documents(&self.store, reloaded, released).await?;
        Ok(())
    }
}

async fn load_documents(store: &StateStore) -> Result<PipelineState, StoreError> {
    let run = store.load(PUBLIC_DOC, PipelineRun::default()).await?;
    let active = store.load(ACTIVE_TASK_DOC, ActiveTaskDoc::default()).await?;
    let fetch = store.load(FETCH_DOC, FetchState::default()).await?;
    Ok(PipelineState::new(run, active, fetch))
}

/// Write back the documents that changed, results first.
async fn commit_documents(
    store: &StateStore,
    before: &PipelineState,
    mut after: PipelineState,
) -> Result<PipelineState, StoreError> {
    if after.run != before.run {
        store
            .save_versioned(PUBLIC_DOC, &mut after.run, before.run.version)
            .await?;
    }
    if after.active != before.active {
        store
            .save_versioned(ACTIVE_TASK_DOC, &mut after.active, before.active.version)
            .await?;
    }
    if after.fetch != before.fetch {
        store
            .save_versioned(FETCH_DOC, &mut after.fetch, before.fetch.version)
            .await?;
    }
    Ok(after)
}

async fn launch_stage(
    launcher: &dyn StageLauncher,
    stage: Stage,
    folder: Option<&str>,
) -> Result<(), CoordinatorError> {
    match launcher.launch(stage, folder).await {
        Ok(()) => Ok(()),
        Err(LaunchError::NotConfigured(stage)) => {
            warn!(stage = stage.as_str(), "no command configured for stage, leaving it to its own schedule");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
