// src/config.rs
//! Process configuration, read once from the environment at startup and passed
//! down explicitly. Nothing in the crate reads env vars after this point.

use crate::coordinator::stage::Stage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Where pipeline documents live.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackendKind {
    /// Bucket served over HTTP (`{endpoint}/{bucket}/{key}`), bearer-token auth.
    Http {
        endpoint: String,
        bucket: String,
        access_token: String,
    },
    /// A local directory standing in for the bucket.
    Local { root: PathBuf },
    /// Process-local memory; only useful for dry runs of the webhook server.
    Memory,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackendKind,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub api_key: String,
    pub endpoint: String,
}

/// Technical parameters attached to every generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub aspect_ratio: String,
    pub model_version: String,
    /// Public URL of our `/hook` endpoint, forwarded to providers that push.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store: StoreSettings,
    pub primary: Option<ProviderSettings>,
    pub fallback: Option<ProviderSettings>,
    pub fallback_enabled: bool,
    pub video: Option<ProviderSettings>,
    pub params: GenerationParams,
    pub poll_schedule: Vec<Duration>,
    pub max_poll_attempts: u32,
    pub submit_retry_budget: Duration,
    pub status_timeout: Duration,
    pub media_timeout: Duration,
    pub webhook_secret: Option<String>,
    pub webhook_bind: String,
    pub stage_commands: HashMap<Stage, String>,
    pub processing_lock_stale_after: Duration,
    pub auto_upscale_action: Option<String>,
}

const DEFAULT_SCHEDULE_SECS: [u64; 5] = [60, 120, 180, 300, 600];

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("STORE_BACKEND").as_deref().unwrap_or("http") {
            "http" => StoreBackendKind::Http {
                endpoint: get("STORE_ENDPOINT").ok_or(ConfigError::Missing("STORE_ENDPOINT"))?,
                bucket: get("STORE_BUCKET").ok_or(ConfigError::Missing("STORE_BUCKET"))?,
                access_token: get("STORE_ACCESS_TOKEN")
                    .ok_or(ConfigError::Missing("STORE_ACCESS_TOKEN"))?,
            },
            "local" => StoreBackendKind::Local {
                root: get("STORE_LOCAL_ROOT")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::Missing("STORE_LOCAL_ROOT"))?,
            },
            "memory" => StoreBackendKind::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORE_BACKEND",
                    message: format!("unknown backend '{}' (expected http, local or memory)", other),
                })
            }
        };

        let store = StoreSettings {
            backend,
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("genpipe-scratch")),
            timeout: secs(&get, "STORE_TIMEOUT_SECS", 30)?,
        };

        let provider = |key_var: &str, endpoint_var: &str, default_endpoint: &str| {
            get(key_var).map(|api_key| ProviderSettings {
                api_key,
                endpoint: get(endpoint_var).unwrap_or_else(|| default_endpoint.to_string()),
            })
        };

        let poll_schedule = match get("POLL_SCHEDULE_SECS") {
            Some(raw) => parse_schedule(&raw)?,
            None => DEFAULT_SCHEDULE_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
        };
        let max_poll_attempts = match get("MAX_POLL_ATTEMPTS") {
            Some(raw) => parse_number::<u32>("MAX_POLL_ATTEMPTS", &raw)?,
            None => poll_schedule.len() as u32,
        };
        if max_poll_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_POLL_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        let webhook_secret = get("WEBHOOK_SECRET");

        let mut stage_commands = HashMap::new();
        for stage in Stage::ALL {
            if let Some(command) = get(&format!("STAGE_COMMAND_{}", stage.env_suffix())) {
                stage_commands.insert(stage, command);
            }
        }

        Ok(Self {
            store,
            primary: provider("PRIMARY_API_KEY", "PRIMARY_ENDPOINT", "https://api.goapi.ai"),
            fallback: provider("FALLBACK_API_KEY", "FALLBACK_ENDPOINT", "https://api.bfl.ml"),
            fallback_enabled: flag(&get, "FALLBACK_ENABLED", false)?,
            video: provider("VIDEO_API_KEY", "VIDEO_ENDPOINT", "https://api.klingai.com"),
            params: GenerationParams {
                aspect_ratio: get("ASPECT_RATIO").unwrap_or_else(|| "9:16".to_string()),
                model_version: get("MODEL_VERSION").unwrap_or_else(|| "6.1".to_string()),
                webhook_url: get("PUBLIC_WEBHOOK_URL"),
                webhook_secret: webhook_secret.clone(),
            },
            poll_schedule,
            max_poll_attempts,
            submit_retry_budget: secs(&get, "SUBMIT_RETRY_BUDGET_SECS", 60)?,
            status_timeout: secs(&get, "STATUS_TIMEOUT_SECS", 20)?,
            media_timeout: secs(&get, "MEDIA_TIMEOUT_SECS", 300)?,
            webhook_secret,
            webhook_bind: get("WEBHOOK_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            stage_commands,
            processing_lock_stale_after: secs(&get, "PROCESSING_LOCK_STALE_SECS", 1800)?,
            auto_upscale_action: get("AUTO_UPSCALE_ACTION"),
        })
    }

    /// The webhook server cannot run without a shared secret.
    pub fn require_webhook_secret(&self) -> Result<&str, ConfigError> {
        self.webhook_secret
            .as_deref()
            .ok_or(ConfigError::Missing("WEBHOOK_SECRET"))
    }
}

fn parse_schedule(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let mut schedule = Vec::new();
    for part in raw.split(',') {
        let value = parse_number::<u64>("POLL_SCHEDULE_SECS", part.trim())?;
        schedule.push(Duration::from_secs(value));
    }
    validate_schedule(&schedule)?;
    Ok(schedule)
}

/// Schedules must be non-empty and strictly ascending.
pub fn validate_schedule(schedule: &[Duration]) -> Result<(), ConfigError> {
    if schedule.is_empty() {
        return Err(ConfigError::Invalid {
            var: "POLL_SCHEDULE_SECS",
            message: "schedule is empty".to_string(),
        });
    }
    if schedule.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(ConfigError::Invalid {
            var: "POLL_SCHEDULE_SECS",
            message: "thresholds must be strictly ascending".to_string(),
        });
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::Invalid {
        var,
        message: format!("'{}' is not a valid number", raw),
    })
}

fn secs<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => Ok(Duration::from_secs(parse_number::<u64>(var, &raw)?)),
        None => Ok(Duration::from_secs(default)),
    }
}

fn flag<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var,
            message: format!("'{}' is not a boolean", other),
        }),
    }
}
