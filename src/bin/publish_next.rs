// Pop the oldest folder off the publish queue and launch the publish stage.
// Prints the folder so wrapper scripts can pick it up.
use genpipe::config::PipelineConfig;
use genpipe::coordinator::Coordinator;
use genpipe::logging::init_logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(e) = init_logging("publish") {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

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
            return ExitCode::FAILURE;
        }
    };

    match coordinator.take_next_publish().await {
        Ok(Some(folder)) => {
            tracing::info!(folder = %folder, "📤 publish started");
            println!("{}", folder);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            tracing::info!("publish queue is empty");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "publish step failed");
            ExitCode::from(e.exit_code().max(1))
        }
    }
}
