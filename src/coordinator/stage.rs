// src/coordinator/stage.rs
//! Pipeline stages and how the next one gets started.

use crate::store::documents::TaskStage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Topic,
    Text,
    Image,
    Video,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Topic,
        Stage::Text,
        Stage::Image,
        Stage::Video,
        Stage::Publish,
    ];

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Topic => Some(Stage::Text),
            Stage::Text => Some(Stage::Image),
            Stage::Image => Some(Stage::Video),
            Stage::Video => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Topic => "topic",
            Stage::Text => "text",
            Stage::Image => "image",
            Stage::Video => "video",
            Stage::Publish => "publish",
        }
    }

    /// Suffix of the `STAGE_COMMAND_*` variable for this stage.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Stage::Topic => "TOPIC",
            Stage::Text => "TEXT",
            Stage::Image => "IMAGE",
            Stage::Video => "VIDEO",
            Stage::Publish => "PUBLISH",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl From<TaskStage> for Stage {
    fn from(stage: TaskStage) -> Self {
        match stage {
            TaskStage::Image => Stage::Image,
            TaskStage::Video => Stage::Video,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no command configured for stage {0}")]
    NotConfigured(Stage),
    #[error("failed to start stage {stage}: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
}

/// Starts a stage process. The launcher does not wait for the stage to finish;
/// stages report back through the store like every other runner.
#[async_trait]
pub trait StageLauncher: Send + Sync {
    async fn launch(&self, stage: Stage, folder: Option<&str>) -> Result<(), LaunchError>;
}

/// Runs `STAGE_COMMAND_<STAGE>` through `sh -c`, detached.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    commands: HashMap<Stage, String>,
}

impl CommandLauncher {
    pub fn new(commands: HashMap<Stage, String>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl StageLauncher for CommandLauncher {
    async fn launch(&self, stage: Stage, folder: Option<&str>) -> Result<(), LaunchError> {
        let command = self
            .commands
            .get(&stage)
            .ok_or(LaunchError::NotConfigured(stage))?;

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .env("GENPIPE_STAGE", stage.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(folder) = folder {
            process.env("GENPIPE_FOLDER", folder);
        }

        let child = process
            .spawn()
            .map_err(|source| LaunchError::Spawn { stage, source })?;

        tracing::info!(
            stage = stage.as_str(),
            folder = folder.unwrap_or(""),
            pid = child.id().unwrap_or(0),
            "▶️ stage launched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence() {
        assert_eq!(Stage::Image.next(), Some(Stage::Video));
        assert_eq!(Stage::Video.next(), Some(Stage::Publish));
        assert_eq!(Stage::Publish.next(), None);
        assert_eq!(Stage::from(TaskStage::Video), Stage::Video);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Stage::parse("Video"), Some(Stage::Video));
        assert_eq!(Stage::parse(" publish "), Some(Stage::Publish));
        assert_eq!(Stage::parse("audio"), None);
    }

    #[tokio::test]
    async fn test_unconfigured_stage_is_an_error() {
        let launcher = CommandLauncher::default();
        let err = launcher.launch(Stage::Publish, Some("media/t1")).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotConfigured(Stage::Publish)));
    }

    #[tokio::test]
    async fn test_command_receives_stage_and_folder() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launched");
        let mut commands = HashMap::new();
        commands.insert(
            Stage::Publish,
            format!("printf '%s %s' \"$GENPIPE_STAGE\" \"$GENPIPE_FOLDER\" > {}", marker.display()),
        );
        let launcher = CommandLauncher::new(commands);
        launcher.launch(Stage::Publish, Some("media/t1")).await.unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&marker).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(contents, "publish media/t1");
    }
}
