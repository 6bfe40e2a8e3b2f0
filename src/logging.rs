use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Default directives: `info` for lectern, quieter query logging from sqlx.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Installs the stderr fmt subscriber. `LECTERN_LOG` takes precedence over `RUST_LOG`.
pub fn init() -> anyhow::Result<()> {
    let filter = match std::env::var("LECTERN_LOG") {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives.trim()).context("parse LECTERN_LOG")?
        }
        _ => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
            .context("build log filter")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
