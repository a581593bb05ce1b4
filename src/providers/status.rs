// src/providers/status.rs
//! Status vocabularies. Each provider gets one table; unknown strings are
//! treated as still running and logged, so new provider wording shows up in
//! the logs instead of crashing a poll cycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedStatus {
    InProgress,
    Completed,
    Failed,
}

impl NormalizedStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NormalizedStatus::InProgress)
    }
}

#[derive(Debug)]
pub struct StatusVocabulary {
    pub provider: &'static str,
    pub completed: &'static [&'static str],
    pub failed: &'static [&'static str],
    /// Known non-terminal values. Anything else is still in progress but warned about.
    pub in_progress: &'static [&'static str],
}

const COMMON_COMPLETED: [&str; 3] = ["finished", "success", "completed"];
const COMMON_FAILED: [&str; 2] = ["failed", "error"];

pub static MIDJOURNEY: StatusVocabulary = StatusVocabulary {
    provider: "midjourney",
    completed: &COMMON_COMPLETED,
    failed: &COMMON_FAILED,
    in_progress: &["pending", "staged", "processing", "starting", "submitted", "in_progress"],
};

pub static FALLBACK_IMAGE: StatusVocabulary = StatusVocabulary {
    provider: "fallback-image",
    completed: &["finished", "success", "completed", "ready"],
    failed: &["failed", "error", "content moderated", "request moderated"],
    in_progress: &["queued", "pending", "running", "task not found"],
};

pub static VIDEO: StatusVocabulary = StatusVocabulary {
    provider: "video",
    completed: &["finished", "success", "completed", "succeed"],
    failed: &COMMON_FAILED,
    in_progress: &["submitted", "processing", "pending", "queued"],
};

impl StatusVocabulary {
    pub fn normalize(&self, raw: &str) -> NormalizedStatus {
        let value = raw.trim().to_ascii_lowercase();
        if self.completed.contains(&value.as_str()) {
            NormalizedStatus::Completed
        } else if self.failed.contains(&value.as_str()) {
            NormalizedStatus::Failed
        } else {
            if !self.in_progress.contains(&value.as_str()) {
                tracing::warn!(
                    provider = self.provider,
                    status = raw,
                    "unrecognized provider status, treating as in progress"
                );
            }
            NormalizedStatus::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(vocabulary: &StatusVocabulary, cases: &[(&str, NormalizedStatus)]) {
        for (raw, expected) in cases {
            assert_eq!(vocabulary.normalize(raw), *expected, "{} / {}", vocabulary.provider, raw);
        }
    }

    #[test]
    fn test_midjourney_vocabulary() {
        use NormalizedStatus::*;
        check(
            &MIDJOURNEY,
            &[
                ("Completed", Completed),
                ("finished", Completed),
                ("success", Completed),
                ("Failed", Failed),
                ("error", Failed),
                ("Pending", InProgress),
                ("Staged", InProgress),
                ("Processing", InProgress),
                ("", InProgress),
                ("teleporting", InProgress),
            ],
        );
    }

    #[test]
    fn test_fallback_vocabulary() {
        use NormalizedStatus::*;
        check(
            &FALLBACK_IMAGE,
            &[
                ("Ready", Completed),
                ("success", Completed),
                ("Content Moderated", Failed),
                ("Error", Failed),
                ("Queued", InProgress),
                ("Task not found", InProgress),
                ("mystery", InProgress),
            ],
        );
    }

    #[test]
    fn test_video_vocabulary() {
        use NormalizedStatus::*;
        check(
            &VIDEO,
            &[
                ("succeed", Completed),
                ("completed", Completed),
                ("failed", Failed),
                ("submitted", InProgress),
                ("processing", InProgress),
                ("rendering-ish", InProgress),
            ],
        );
    }

    #[test]
    fn test_terminal() {
        assert!(NormalizedStatus::Completed.is_terminal());
        assert!(NormalizedStatus::Failed.is_terminal());
        assert!(!NormalizedStatus::InProgress.is_terminal());
    }
}
