//! Structured logging for the connection and request lifecycle.
//!
//! The crate itself only emits [`tracing`] spans and events; it never installs
//! a global subscriber on its own (a library doing that would fight with
//! whatever the embedding binary wants). [`LoggingConfig::init`] is an opt-in
//! helper an application can call once at startup — built from the
//! `log_level`/`log_file_path` keys in [`crate::config::ServerConfig`] — that
//! wires up a `tracing_subscriber::fmt` layer the way the demos do.

use crate::config::ServerConfig;
use std::{fmt, fs::OpenOptions, io, path::PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The logging-relevant slice of a [`ServerConfig`]: a verbosity level and an
/// optional destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `0` disables logging entirely; `1`..=`5` map to `error`..=`trace`.
    pub level: u8,
    /// `None` logs to stderr; `Some(path)` appends to that file instead.
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: 2,
            file_path: None,
        }
    }
}

impl From<&ServerConfig> for LoggingConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            level: config.log_level,
            file_path: (!config.log_file_path.is_empty()).then(|| config.log_file_path.clone().into()),
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        if let Ok(from_env) = EnvFilter::try_from_default_env() {
            return from_env;
        }

        let level = match self.level {
            0 => "off",
            1 => "error",
            2 => "warn",
            3 => "info",
            4 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    }

    /// Installs a `tracing_subscriber` global subscriber matching this
    /// config. Call once, before [`crate::Server::launch`].
    ///
    /// # Panics
    /// Panics if a global subscriber has already been installed (the same
    /// restriction `tracing_subscriber`'s own `init()` carries).
    pub fn init(&self) -> Result<(), InitError> {
        let filter = self.filter();

        match &self.file_path {
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(move || file.try_clone().expect("log file handle")),
                    )
                    .init();
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct InitError(io::Error);

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not open log file: {}", self.0)
    }
}

impl std::error::Error for InitError {}

impl From<io::Error> for InitError {
    fn from(err: io::Error) -> Self {
        InitError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_empty_path_to_stderr() {
        let config = ServerConfig::default();
        let logging = LoggingConfig::from(&config);
        assert_eq!(logging.file_path, None);
    }

    #[test]
    fn config_maps_nonempty_path() {
        let mut config = ServerConfig::default();
        config.log_file_path = "/tmp/reactorweb.log".to_string();
        let logging = LoggingConfig::from(&config);
        assert_eq!(logging.file_path, Some(PathBuf::from("/tmp/reactorweb.log")));
    }
}
