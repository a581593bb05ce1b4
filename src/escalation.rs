// src/escalation.rs
//! When to poll, when to keep waiting, and when to give up on a task.
//!
//! The policy is a pure function of elapsed time since submission and the
//! number of polls that returned a real (non-terminal) answer. Polls that got
//! no answer at all never count as attempts.

use crate::config::{validate_schedule, ConfigError, PipelineConfig};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do until `until` has elapsed since submission.
    Wait { until: Duration },
    PollNow,
    /// Poll budget exhausted.
    Escalate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    schedule: Vec<Duration>,
    max_attempts: u32,
}

impl EscalationPolicy {
    pub fn new(schedule: Vec<Duration>, max_attempts: u32) -> Result<Self, ConfigError> {
        validate_schedule(&schedule)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_POLL_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            schedule,
            max_attempts,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Self::new(config.poll_schedule.clone(), config.max_poll_attempts)
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn decide(&self, elapsed: Duration, attempts: u32) -> Decision {
        if attempts >= self.max_attempts {
            return Decision::Escalate;
        }

        let first = self.schedule[0];
        if elapsed < first {
            return Decision::Wait { until: first };
        }

        let index = (attempts as usize).min(self.schedule.len() - 1);
        let threshold = self.schedule[index];
        if elapsed >= threshold {
            Decision::PollNow
        } else {
            Decision::Wait { until: threshold }
        }
    }

    /// `decide` against wall-clock timestamps. A submission time in the future
    /// (clock skew between hosts) counts as zero elapsed.
    pub fn decide_at(&self, submitted_at: DateTime<Utc>, now: DateTime<Utc>, attempts: u32) -> Decision {
        self.decide(elapsed_since(submitted_at, now), attempts)
    }
}

pub fn elapsed_since(submitted_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - submitted_at).to_std().unwrap_or(Duration::ZERO)
}
