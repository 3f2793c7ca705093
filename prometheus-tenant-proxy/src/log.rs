use anyhow::Context as _;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTERING_DIRECTIVES: &str = "info";

/// Installs the global tracing subscriber (compact fmt layer on stdout).
///
/// Filtering directives are read from `PROM_PROXY_LOG`, falling back to `info`.
pub fn init(filtering_directives: Option<&str>) -> anyhow::Result<()> {
    let filter = filtering_directives
        .map(EnvFilter::try_new)
        .unwrap_or_else(|| EnvFilter::try_new(DEFAULT_FILTERING_DIRECTIVES))
        .context("invalid filtering directives")?;

    let fmt_layer = fmt::layer().compact().with_filter(filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .context("failed to install the tracing subscriber")?;

    Ok(())
}
