// One poll cycle: finish a deferred finalize, then poll, escalate or wait on
// the active task. Meant to be run from cron.
use genpipe::config::PipelineConfig;
use genpipe::coordinator::Coordinator;
use genpipe::logging::init_logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(e) = init_logging("poll") {
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

    match coordinator.poll_once(chrono::Utc::now()).await {
        Ok(report) => {
            tracing::info!(
                finalize = ?report.deferred_finalize,
                poll = ?report.poll,
                misses = coordinator.poll_misses(),
                "poll cycle done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "poll cycle failed");
            ExitCode::from(e.exit_code().max(1))
        }
    }
}
