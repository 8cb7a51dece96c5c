use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, with the span list
    #[default]
    Json,
    /// Human-readable multi-line output for development
    Pretty,
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty())
            .try_init(),
    };
    installed.map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!("Meridian logging initialized ({:?}, default level {})", format, default_level);
    Ok(())
}

/// Span of a long-running background component
pub fn component_span(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
    )
}

/// Create a span for one backend exchange of a route
pub fn create_backend_span(endpoint: &str, route_id: &str) -> tracing::Span {
    tracing::info_span!("backend_request", backend.url = endpoint, route.id = route_id)
}
