use axum::Router;
use genpipe::config::PipelineConfig;
use genpipe::coordinator::Coordinator;
use genpipe::logging::init_logging;
use genpipe::{handlers, AppState};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    if let Err(e) = init_logging("webhook") {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "webhook server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = PipelineConfig::from_env()?;
    let secret = config.require_webhook_secret()?.to_string();

    let coordinator = Coordinator::from_config(&config)?;
    let providers = coordinator.providers().configured();
    if providers.is_empty() {
        tracing::warn!("no generation providers configured; webhook deliveries can still be folded in");
    } else {
        tracing::info!(?providers, fallback_enabled = config.fallback_enabled, "providers ready");
    }

    // A delivery may run a finalize, which downloads media.
    let request_timeout = config.media_timeout + Duration::from_secs(60);
    let state = Arc::new(AppState::new(coordinator, secret, request_timeout));
    let app: Router = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.webhook_bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
