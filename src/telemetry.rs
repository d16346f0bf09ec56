use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins over `level`; `json`
/// switches to one JSON object per event. Logs go to stderr so they do not
/// interleave with command output.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter: {level}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("tracing subscriber already installed")?;

    tracing::debug!(level, json, "tracing initialized");
    Ok(())
}

/// Span grouping everything one CLI command does.
pub fn command_span(command: &str) -> tracing::Span {
    tracing::info_span!("command", name = command)
}
