use opsflow_core::config::{AppConfig, LogFormat, LoadOptions, LoggingConfig};
use tracing::Level;

/// Installs the global subscriber on stderr so stdout stays a single JSON
/// payload. Falls back to default logging when the config does not load;
/// the command itself reports that failure.
pub fn init_logging() -> anyhow::Result<()> {
    let logging = AppConfig::load(LoadOptions::default())
        .map(|config| config.logging)
        .unwrap_or_else(|_| AppConfig::default().logging);
    init_with(&logging)
}

pub fn init_with(logging: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(log_level);

    let installed = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}
