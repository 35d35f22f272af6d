//! `key=value` file and environment-variable configuration loading.
//!
//! Keys are the same whether they come from a file (`#` starts a comment) or
//! from an environment variable named `UVHTTP_<KEY_UPPERCASED>`; the latter
//! always wins when both are present. [`ServerConfig::into_limits`] splits the
//! flat key table into the `*Limits` structs the rest of the crate already
//! consumes, so a loaded config slots into [`crate::ServerBuilder`] the same
//! way a hand-built `ServerLimits`/`ConnLimits`/... would.

use crate::limits::{ConnLimits, RateLimiterLimits, ReqLimits, RespLimits, ServerLimits};
use std::{collections::HashMap, env, fmt, fs, io, path::Path, time::Duration};

const ENV_PREFIX: &str = "UVHTTP_";

/// A validated, flattened view of the key table in SPEC_FULL.md §6.
///
/// Every field has the same default as the corresponding `*Limits` struct;
/// loading from a file or the environment only overrides the keys present.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub backlog: u32,
    pub keepalive_timeout: Duration,
    pub request_timeout: Duration,
    pub max_body_size: usize,
    pub max_header_size: usize,
    pub max_url_size: usize,
    pub max_requests_per_connection: usize,
    pub rate_limit_window: Duration,
    pub enable_tls: bool,
    /// Advisory; nothing in this crate allocates a fixed memory pool, so this
    /// is carried through only for config round-tripping.
    pub memory_pool_size: usize,
    /// `0` (silent) through `5` (trace); see [`crate::logging::LoggingConfig`].
    pub log_level: u8,
    /// Empty string means stderr.
    pub log_file_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 500,
            read_buffer_size: 8 * 1024,
            backlog: 128,
            keepalive_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_body_size: 4 * 1024,
            max_header_size: 512,
            max_url_size: 256,
            max_requests_per_connection: 100,
            rate_limit_window: Duration::from_secs(60),
            enable_tls: false,
            memory_pool_size: 0,
            log_level: 2,
            log_file_path: String::new(),
        }
    }
}

/// Why loading or validating a [`ServerConfig`] failed.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    /// `key` held a value that didn't parse as its expected type.
    InvalidValue { key: String, value: String },
    /// `key` parsed but fell outside its documented range.
    OutOfRange { key: String, value: String },
    UnknownKey(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read configuration file: {e}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value {value:?} for key {key:?}")
            }
            ConfigError::OutOfRange { key, value } => {
                write!(f, "value {value:?} for key {key:?} is out of range")
            }
            ConfigError::UnknownKey(key) => write!(f, "unrecognized configuration key {key:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl ServerConfig {
    /// Loads and validates a `key=value` file, falling back to the defaults
    /// for any key not present.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut pairs = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            pairs.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        Self::from_pairs(pairs)
    }

    /// Builds a config from `UVHTTP_`-prefixed environment variables,
    /// falling back to the defaults for any key not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut pairs = HashMap::new();
        for (name, value) in env::vars() {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                pairs.insert(key.to_ascii_lowercase(), value);
            }
        }
        Self::from_pairs(pairs)
    }

    /// Loads from a file, then overlays any `UVHTTP_`-prefixed environment
    /// variables on top (the environment always wins).
    pub fn from_file_and_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        let from_env = Self::from_env()?;
        for (name, _) in env::vars() {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                config.apply(&key.to_ascii_lowercase(), &from_env)?;
            }
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, source: &ServerConfig) -> Result<(), ConfigError> {
        macro_rules! copy {
            ($field:ident) => {{
                self.$field = source.$field.clone();
                return Ok(());
            }};
        }
        match key {
            "max_connections" => copy!(max_connections),
            "read_buffer_size" => copy!(read_buffer_size),
            "backlog" => copy!(backlog),
            "keepalive_timeout" => copy!(keepalive_timeout),
            "request_timeout" => copy!(request_timeout),
            "max_body_size" => copy!(max_body_size),
            "max_header_size" => copy!(max_header_size),
            "max_url_size" => copy!(max_url_size),
            "max_requests_per_connection" => copy!(max_requests_per_connection),
            "rate_limit_window" => copy!(rate_limit_window),
            "enable_tls" => copy!(enable_tls),
            "memory_pool_size" => copy!(memory_pool_size),
            "log_level" => copy!(log_level),
            "log_file_path" => copy!(log_file_path),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }

    fn from_pairs(pairs: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, value) in pairs {
            match key.as_str() {
                "max_connections" => {
                    config.max_connections = parse_range(&key, &value, 1..=65535)?;
                }
                "read_buffer_size" => {
                    config.read_buffer_size =
                        parse_range(&key, &value, 1024..=1024 * 1024)?;
                }
                "backlog" => config.backlog = parse(&key, &value)?,
                "keepalive_timeout" => {
                    config.keepalive_timeout = Duration::from_secs(parse(&key, &value)?);
                }
                "request_timeout" => {
                    config.request_timeout = Duration::from_secs(parse(&key, &value)?);
                }
                "max_body_size" => {
                    config.max_body_size =
                        parse_range(&key, &value, 1..=100 * 1024 * 1024)?;
                }
                "max_header_size" => config.max_header_size = parse(&key, &value)?,
                "max_url_size" => config.max_url_size = parse(&key, &value)?,
                "max_requests_per_connection" => {
                    config.max_requests_per_connection = parse(&key, &value)?;
                }
                "rate_limit_window" => {
                    config.rate_limit_window = Duration::from_secs(parse(&key, &value)?);
                }
                "enable_tls" => config.enable_tls = parse_bool(&key, &value)?,
                "memory_pool_size" => config.memory_pool_size = parse(&key, &value)?,
                "log_level" => config.log_level = parse_range(&key, &value, 0..=5)?,
                "log_file_path" => config.log_file_path = value,
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }

        Ok(config)
    }

    /// Splits this config into the per-component limit structs the rest of
    /// the crate consumes, keeping every field this config doesn't govern at
    /// its own default.
    pub fn into_limits(self) -> (ServerLimits, ConnLimits, ReqLimits, RespLimits, RateLimiterLimits) {
        let server_limits = ServerLimits {
            max_connections: self.max_connections,
            ..ServerLimits::default()
        };
        let conn_limits = ConnLimits {
            socket_read_timeout: self.keepalive_timeout,
            // No per-handler wallclock timer exists (handlers run to completion
            // synchronously); `connection_lifetime` is the closest safety net.
            connection_lifetime: self.request_timeout,
            max_requests_per_connection: self.max_requests_per_connection,
            ..ConnLimits::default()
        };
        let req_limits = ReqLimits {
            url_size: self.max_url_size,
            header_value_size: self.max_header_size,
            body_size: self.max_body_size,
            ..ReqLimits::default()
        };
        let resp_limits = RespLimits::default();
        let rate_limiter_limits = RateLimiterLimits {
            window: self.rate_limit_window,
            ..RateLimiterLimits::default()
        };

        (server_limits, conn_limits, req_limits, resp_limits, rate_limiter_limits)
    }

    /// Just the rate-limiter window, for passing to
    /// [`crate::ServerBuilder::rate_limiter`] alongside `.config(..)`.
    pub fn rate_limiter_limits(&self) -> RateLimiterLimits {
        RateLimiterLimits {
            window: self.rate_limit_window,
            ..RateLimiterLimits::default()
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_range<T>(key: &str, value: &str, range: std::ops::RangeInclusive<T>) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd,
{
    let parsed = parse(key, value)?;
    if range.contains(&parsed) {
        Ok(parsed)
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_recommendations() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.max_requests_per_connection, 100);
        assert_eq!(config.keepalive_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parses_key_value_pairs_ignoring_comments_and_blank_lines() {
        let mut pairs = HashMap::new();
        pairs.insert("max_connections".to_string(), "1000".to_string());
        pairs.insert("log_level".to_string(), "4".to_string());
        let config = ServerConfig::from_pairs(pairs).unwrap();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.log_level, 4);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut pairs = HashMap::new();
        pairs.insert("max_connections".to_string(), "0".to_string());
        let err = ServerConfig::from_pairs(pairs).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut pairs = HashMap::new();
        pairs.insert("not_a_real_key".to_string(), "1".to_string());
        let err = ServerConfig::from_pairs(pairs).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn into_limits_carries_over_overridden_fields() {
        let mut config = ServerConfig::default();
        config.max_connections = 42;
        config.max_body_size = 2048;
        let (server_limits, _, req_limits, _, _) = config.into_limits();
        assert_eq!(server_limits.max_connections, 42);
        assert_eq!(req_limits.body_size, 2048);
    }
}
