// src/coordinator/state.rs
//! Pure state transitions. Nothing here touches the network or the store;
//! every function takes the loaded documents and returns the documents to
//! write back plus the side effects (`Intent`s) the caller must run.

use super::stage::Stage;
use crate::escalation::{Decision, EscalationPolicy};
use crate::providers::status::NormalizedStatus;
use crate::providers::{StatusReport, TaskHandle};
use crate::store::documents::{
    ActiveTaskDoc, EscalationMarker, FetchState, GenerationRequest, GenerationTask, PipelineRun,
    ProviderSlot, ResultOutcome, TaskResults, TaskStage, TaskStatus,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The three pipeline documents as loaded together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub run: PipelineRun,
    pub active: ActiveTaskDoc,
    /// Already reconciled against `active` (see `FetchState::belonging_to`).
    pub fetch: FetchState,
}

impl PipelineState {
    pub fn new(run: PipelineRun, active: ActiveTaskDoc, fetch: FetchState) -> Self {
        let fetch = fetch.belonging_to(active.active_task_id());
        Self { run, active, fetch }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A poll or a webhook delivered a status for `task_id`.
    Observed {
        task_id: String,
        report: StatusReport,
    },
    /// The poll budget ran out before the task reached a terminal status.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Archive the outputs of `task_id` and launch whatever comes next.
    Finalize { task_id: String },
    /// Submit the retired primary task's request to the fallback provider.
    SubmitFallback { retired: GenerationTask },
    /// Run a follow-up action on a finished task as its own task.
    SubmitAction {
        parent: GenerationTask,
        action: String,
    },
    RunStage { stage: Stage, folder: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Event was for a task that is not (or no longer) active.
    Ignored,
    Pending,
    Completed,
    Failed,
    Escalated,
    Abandoned,
    SubTask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: PipelineState,
    pub intents: Vec<Intent>,
    pub outcome: Outcome,
}

impl Transition {
    fn unchanged(state: PipelineState) -> Self {
        Self {
            state,
            intents: Vec::new(),
            outcome: Outcome::Ignored,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub policy: &'a EscalationPolicy,
    /// Fallback provider configured and enabled.
    pub fallback_available: bool,
    pub auto_upscale_action: Option<&'a str>,
}

pub fn advance(state: PipelineState, event: TaskEvent, ctx: &TransitionContext<'_>) -> Transition {
    match event {
        TaskEvent::Observed { task_id, report } => observe(state, &task_id, report, ctx),
        TaskEvent::Exhausted => escalate(state, ctx),
    }
}

fn observe(
    mut state: PipelineState,
    task_id: &str,
    report: StatusReport,
    ctx: &TransitionContext<'_>,
) -> Transition {
    let Some(task) = state.active.task.clone() else {
        tracing::info!(task_id, "report for a task that is no longer active, discarding");
        return Transition::unchanged(state);
    };
    if task.task_id != task_id {
        tracing::info!(
            task_id,
            active_task_id = %task.task_id,
            "report for a task other than the active one, discarding"
        );
        return Transition::unchanged(state);
    }

    match report.status {
        NormalizedStatus::Completed => {
            if let Some(action) = upscale_action(&task, &report, ctx) {
                state.active.task = None;
                state.fetch = reset_fetch(&state.fetch);
                tracing::info!(task_id, action, "task completed, submitting follow-up action");
                return Transition {
                    state,
                    intents: vec![Intent::SubmitAction {
                        parent: task,
                        action: action.to_string(),
                    }],
                    outcome: Outcome::SubTask,
                };
            }

            state.run.results = Some(TaskResults::completed(&task, report.output_urls, ctx.now));
            state.active.task = None;
            state.fetch.done = true;
            tracing::info!(task_id, "✅ task completed");
            Transition {
                state,
                intents: vec![Intent::Finalize {
                    task_id: task.task_id,
                }],
                outcome: Outcome::Completed,
            }
        }
        NormalizedStatus::Failed => {
            if fallback_eligible(&task, ctx) {
                tracing::warn!(task_id, error = ?report.error, "primary task failed, escalating to fallback");
                return escalate(state, ctx);
            }
            let error = report
                .error
                .unwrap_or_else(|| "provider reported failure".to_string());
            tracing::error!(task_id, error = %error, "❌ task failed");
            state.run.results = Some(TaskResults::unsuccessful(
                &task,
                ResultOutcome::Failed,
                error,
                ctx.now,
            ));
            state.active.task = None;
            state.fetch.done = true;
            Transition {
                state,
                intents: Vec::new(),
                outcome: Outcome::Failed,
            }
        }
        NormalizedStatus::InProgress => {
            let mut task = task;
            task.attempts += 1;
            task.status = TaskStatus::InProgress;
            state.fetch.fetch_attempts += 1;
            let decision = ctx.policy.decide_at(task.submitted_at, ctx.now, task.attempts);
            tracing::debug!(task_id, attempts = task.attempts, ?decision, "task still in progress");
            state.active.task = Some(task);
            if decision == Decision::Escalate {
                return escalate(state, ctx);
            }
            Transition {
                state,
                intents: Vec::new(),
                outcome: Outcome::Pending,
            }
        }
    }
}

/// Retire the active task after its poll budget ran out (or the primary
/// reported failure). The task reference is cleared and the marker written in
/// the same document, before any fallback is submitted, so re-running this
/// on the saved state finds nothing to escalate.
pub fn escalate(mut state: PipelineState, ctx: &TransitionContext<'_>) -> Transition {
    let Some(task) = state.active.task.take() else {
        return Transition::unchanged(state);
    };
    state.fetch = reset_fetch(&state.fetch);

    if fallback_eligible(&task, ctx) {
        state.active.last_escalation = Some(EscalationMarker {
            from_task_id: task.task_id.clone(),
            to_provider: Some(ProviderSlot::Fallback),
            at: ctx.now,
        });
        tracing::warn!(
            task_id = %task.task_id,
            attempts = task.attempts,
            "⏫ escalating task to fallback provider"
        );
        return Transition {
            state,
            intents: vec![Intent::SubmitFallback { retired: task }],
            outcome: Outcome::Escalated,
        };
    }

    state.active.last_escalation = Some(EscalationMarker {
        from_task_id: task.task_id.clone(),
        to_provider: None,
        at: ctx.now,
    });
    state.run.results = Some(TaskResults::unsuccessful(
        &task,
        ResultOutcome::Abandoned,
        format!("gave up after {} polls", task.attempts),
        ctx.now,
    ));
    tracing::error!(task_id = %task.task_id, attempts = task.attempts, "task abandoned");
    Transition {
        state,
        intents: Vec::new(),
        outcome: Outcome::Abandoned,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRejected {
    pub active_task_id: String,
}

/// Make a freshly submitted task the active one.
pub fn record_submission(
    mut state: PipelineState,
    handle: &TaskHandle,
    request: GenerationRequest,
) -> Result<PipelineState, SubmissionRejected> {
    if let Some(live) = state.active.task.as_ref().filter(|t| !t.status.is_terminal()) {
        return Err(SubmissionRejected {
            active_task_id: live.task_id.clone(),
        });
    }
    state.active.task = Some(GenerationTask {
        task_id: handle.task_id.clone(),
        provider: handle.provider,
        request,
        submitted_at: handle.submitted_at,
        attempts: 0,
        status: TaskStatus::Pending,
    });
    state.fetch = FetchState {
        version: state.fetch.version,
        ..FetchState::for_task(&handle.task_id)
    };
    Ok(state)
}

/// Record that a submission which should have replaced a retired task never
/// happened.
pub fn record_lost_submission(
    mut state: PipelineState,
    retired: &GenerationTask,
    error: &str,
    now: DateTime<Utc>,
) -> PipelineState {
    state.run.results = Some(TaskResults::unsuccessful(
        retired,
        ResultOutcome::Abandoned,
        format!("follow-up submission failed: {}", error),
        now,
    ));
    state
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeGate {
    /// Lock taken; caller must archive media then call `end_finalize`.
    Proceed { task_id: String },
    /// Another finalize holds the lock. Retried on a later invocation.
    Deferred,
    /// No completed, unfinalized results.
    NothingToDo,
}

pub fn begin_finalize(run: &mut PipelineRun, now: DateTime<Utc>, stale_after: Duration) -> FinalizeGate {
    let Some(results) = run.results.as_ref().filter(|r| r.awaiting_finalize()) else {
        return FinalizeGate::NothingToDo;
    };

    if run.processing_lock {
        let held_for = run
            .processing_lock_since
            .map(|since| crate::escalation::elapsed_since(since, now));
        match held_for {
            Some(held_for) if held_for >= stale_after => {
                tracing::warn!(
                    held_secs = held_for.as_secs(),
                    "processing lock is stale, taking it over"
                );
            }
            _ => {
                tracing::info!(task_id = %results.task_id, "processing lock held, deferring finalize");
                return FinalizeGate::Deferred;
            }
        }
    }

    let task_id = results.task_id.clone();
    run.processing_lock = true;
    run.processing_lock_since = Some(now);
    FinalizeGate::Proceed { task_id }
}

/// Release the lock and file the archived folder. Returns the stage to launch,
/// if any: images go on to animation, videos join the publish queue.
pub fn end_finalize(
    run: &mut PipelineRun,
    task_id: &str,
    folder: &str,
    archived: usize,
) -> Option<Intent> {
    run.processing_lock = false;
    run.processing_lock_since = None;

    let stage = match run.results.as_mut() {
        Some(results) if results.task_id == task_id => {
            results.finalized = true;
            results.stage.unwrap_or(TaskStage::Image)
        }
        _ => {
            tracing::warn!(task_id, "results were replaced while finalizing");
            return None;
        }
    };

    if archived == 0 {
        run.empty_folders.insert(folder.to_string());
        tracing::warn!(task_id, folder, "no media archived, folder marked empty");
        return None;
    }

    match stage {
        TaskStage::Image => Some(Intent::RunStage {
            stage: Stage::Video,
            folder: Some(folder.to_string()),
        }),
        TaskStage::Video => {
            if !run.publish_list.iter().any(|f| f == folder) {
                run.publish_list.push(folder.to_string());
            }
            None
        }
    }
}

/// Pop the oldest folder off the publish queue.
pub fn take_next_publish(run: &mut PipelineRun) -> Option<Intent> {
    if run.publish_list.is_empty() {
        return None;
    }
    let folder = run.publish_list.remove(0);
    Some(Intent::RunStage {
        stage: Stage::Publish,
        folder: Some(folder),
    })
}

fn fallback_eligible(task: &GenerationTask, ctx: &TransitionContext<'_>) -> bool {
    ctx.fallback_available
        && task.provider == ProviderSlot::Primary
        && matches!(task.request, GenerationRequest::Imagine { .. })
}

fn upscale_action<'a>(
    task: &GenerationTask,
    report: &StatusReport,
    ctx: &TransitionContext<'a>,
) -> Option<&'a str> {
    let action = ctx.auto_upscale_action?;
    let eligible = task.provider == ProviderSlot::Primary
        && matches!(task.request, GenerationRequest::Imagine { .. })
        && report.actions.iter().any(|a| a == action);
    eligible.then_some(action)
}

fn reset_fetch(fetch: &FetchState) -> FetchState {
    FetchState {
        version: fetch.version,
        ..FetchState::default()
    }
}
