use docapproval_core::config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("unsupported log level `{0}`")]
    InvalidLevel(String),
    #[error("global tracing subscriber could not be installed: {0}")]
    AlreadyInitialized(String),
}

pub fn parse_level(level: &str) -> Result<Level, TelemetryError> {
    level.trim().parse::<Level>().map_err(|_| TelemetryError::InvalidLevel(level.to_owned()))
}

/// Installs the process-wide `fmt` subscriber. A second call fails instead of
/// replacing the first subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let level = parse_level(&config.level)?;
    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(level);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|error| TelemetryError::AlreadyInitialized(error.to_string()))
}

#[cfg(test)]
mod tests {
    use docapproval_core::config::{LogFormat, LoggingConfig};
    use tracing::Level;

    use super::{init_logging, parse_level, TelemetryError};

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level(" WARN ").expect("level"), Level::WARN);
        assert!(matches!(parse_level("verbose"), Err(TelemetryError::InvalidLevel(_))));
    }

    #[test]
    fn second_initialisation_is_an_error_not_a_panic() {
        let config = LoggingConfig { level: "debug".to_owned(), format: LogFormat::Json };
        let _ = init_logging(&config);

        let second = init_logging(&config);
        assert!(matches!(second, Err(TelemetryError::AlreadyInitialized(_))));
    }
}
