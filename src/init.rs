use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::Registry;

/// Configuration of local console output, which is where fallback loggers
/// write.
///
/// **Fields**
/// - `default_filter`: filter directive used when `RUST_LOG` is not set.
/// - `with_target`: print the event target (module path) on each line.
/// - `ansi`: colorize output. Serverless log viewers show raw escape codes,
///   so this is off by default.
#[derive(Clone, Debug)]
pub struct LocalLogConfig {
    pub default_filter: String,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for LocalLogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            with_target: false,
            ansi: false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("could not install global subscriber: {0}")]
    Install(#[from] TryInitError),
}

fn filter(config: &LocalLogConfig) -> Result<EnvFilter, ParseError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.default_filter),
    }
}

/// Install a global `tracing` subscriber printing to stdout.
///
/// **Returns**
/// - `Err(InitError::Install)` if a global subscriber is already set.
pub fn init_local_logging_with_config(config: LocalLogConfig) -> Result<(), InitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_ansi(config.ansi);

    Registry::default()
        .with(filter(&config)?)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Equivalent to [`init_local_logging_with_config`] with
/// [`LocalLogConfig::default`].
pub fn init_local_logging() -> Result<(), InitError> {
    init_local_logging_with_config(LocalLogConfig::default())
}
