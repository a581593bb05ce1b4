// src/logging.rs
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber. `process` names the runner in the startup line.
///
/// `RUST_LOG` overrides the filter; `LOG_FORMAT=json` switches to one JSON object
/// per line for log aggregation.
pub fn init_logging(process: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,genpipe=trace,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,genpipe=info,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    let build = if cfg!(debug_assertions) { "development" } else { "production" };
    tracing::info!(
        process,
        version = env!("CARGO_PKG_VERSION"),
        build,
        log_level = %log_level,
        "genpipe starting up"
    );

    Ok(())
}
