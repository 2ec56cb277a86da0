use anyhow::{Context, Result, anyhow};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global console subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directives` (for example
/// `info` or `vidtoast=debug,info`) decides what is printed.
pub fn init_tracing(default_directives: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives)
            .with_context(|| format!("invalid log filter {default_directives:?}"))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!("installing tracing subscriber: {err}"))
}
