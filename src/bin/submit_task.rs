// Submit a generation task for one stage and make it the active task.
//
//   genpipe-submit image "<prompt>" | image @prompt.txt
//   genpipe-submit video "<motion prompt>" [image_url]
//   genpipe-submit action <parent_task_id> <action>
//
// Without an explicit image URL, a video task animates the first image of the
// most recent completed image task.
use genpipe::config::PipelineConfig;
use genpipe::coordinator::{Coordinator, CoordinatorError};
use genpipe::logging::init_logging;
use genpipe::store::documents::{GenerationRequest, TaskStage};
use std::process::ExitCode;

const USAGE: &str = "usage: genpipe-submit image <prompt|@file> | video <prompt|@file> [image_url] | action <parent_task_id> <action>";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(e) = init_logging("submit") {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    let coordinator = match Coordinator::from_config(&config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            tracing::error!(error = %e, "could not set up coordinator");
            return ExitCode::from(e.exit_code().max(1));
        }
    };

    let request = match build_request(&coordinator, &args).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
        Err(e) => {
            tracing::error!(error = %e, "could not build request");
            return ExitCode::from(e.exit_code().max(1));
        }
    };

    match coordinator.submit(request).await {
        Ok(handle) => {
            println!("{}", handle.task_id);
            ExitCode::SUCCESS
        }
        Err(CoordinatorError::TaskActive(task_id)) => {
            tracing::info!(task_id = %task_id, "a task is already active, nothing to submit");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            if code == 0 {
                tracing::warn!(error = %e, "submission deferred to the next run");
            } else {
                tracing::error!(error = %e, "submission failed");
            }
            ExitCode::from(code)
        }
    }
}

async fn build_request(
    coordinator: &Coordinator,
    args: &[String],
) -> Result<Option<GenerationRequest>, CoordinatorError> {
    let request = match args {
        [kind, prompt] if kind == "image" => GenerationRequest::Imagine {
            prompt: read_prompt(prompt)?,
        },
        [kind, prompt, image_url] if kind == "video" => GenerationRequest::Animate {
            prompt: read_prompt(prompt)?,
            image_url: image_url.clone(),
        },
        [kind, prompt] if kind == "video" => {
            let state = coordinator.load_state().await?;
            let image_url = state
                .run
                .results
                .filter(|r| r.stage == Some(TaskStage::Image))
                .and_then(|r| r.image_urls.into_iter().next());
            match image_url {
                Some(image_url) => GenerationRequest::Animate {
                    prompt: read_prompt(prompt)?,
                    image_url,
                },
                None => {
                    tracing::info!("no finished image to animate yet");
                    return Ok(None);
                }
            }
        }
        [kind, parent_task_id, action] if kind == "action" => GenerationRequest::Action {
            parent_task_id: parent_task_id.clone(),
            action: action.clone(),
        },
        _ => return Ok(None),
    };
    Ok(Some(request))
}

fn read_prompt(arg: &str) -> Result<String, CoordinatorError> {
    let prompt = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| CoordinatorError::Store(e.into()))?,
        None => arg.to_string(),
    };
    Ok(prompt.trim().to_string())
}
