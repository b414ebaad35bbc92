//! Configuration module for the event dispatcher.
//!
//! Every setting is optional. Values left unset are resolved when the
//! dispatcher starts: the send timeout, for instance, falls back to the
//! transport's own timeout before using a fixed default.

use std::env;
use std::time::Duration;

/// Default collector endpoint
pub const DEFAULT_ENDPOINT: &str = "https://www.google-analytics.com/batch";

/// Default number of events per batch request
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default interval between timer flushes
pub const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(15);

/// Send timeout used when neither the config nor the transport sets one
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum allowed batch size
const MAX_BATCH_SIZE: usize = 1_000;

/// Bounds for the batch wait interval, in seconds
const MIN_BATCH_WAIT_SECS: u64 = 1;
const MAX_BATCH_WAIT_SECS: u64 = 3_600;

/// Bounds for send and request timeouts, in seconds
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Configuration for the dispatcher and its HTTP transport.
///
/// Settings can be loaded from environment variables:
/// - `DISPATCHER_ENDPOINT`: collector URL (default: the production endpoint)
/// - `DISPATCHER_BATCH_WAIT_SECS`: seconds between timer flushes (default: 15)
/// - `DISPATCHER_SEND_TIMEOUT_SECS`: deadline for one flush (default: transport timeout, else 5)
/// - `DISPATCHER_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: none)
/// - `DISPATCHER_BATCH_SIZE`: events per request (default: 20)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Collector URL batches are posted to
    pub endpoint: Option<String>,

    /// Interval between timer flushes
    pub batch_wait: Option<Duration>,

    /// Deadline for one flush, shared by all requests it issues
    pub send_timeout: Option<Duration>,

    /// Timeout enforced by the HTTP client on each request
    pub request_timeout: Option<Duration>,

    /// Number of events per batch request; 0 means the default
    pub batch_size: usize,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but is not a valid number
    /// or falls outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use event_dispatcher::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Batch size: {}", config.batch_size);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("DISPATCHER_ENDPOINT")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let batch_wait = parse_secs(
            &lookup,
            "DISPATCHER_BATCH_WAIT_SECS",
            MIN_BATCH_WAIT_SECS,
            MAX_BATCH_WAIT_SECS,
        )?;

        let send_timeout = parse_secs(
            &lookup,
            "DISPATCHER_SEND_TIMEOUT_SECS",
            MIN_TIMEOUT_SECS,
            MAX_TIMEOUT_SECS,
        )?;

        let request_timeout = parse_secs(
            &lookup,
            "DISPATCHER_REQUEST_TIMEOUT_SECS",
            MIN_TIMEOUT_SECS,
            MAX_TIMEOUT_SECS,
        )?;

        let batch_size = parse_batch_size(&lookup)?;

        Ok(Self {
            endpoint,
            batch_wait,
            send_timeout,
            request_timeout,
            batch_size,
        })
    }
}

impl Default for Config {
    /// Create a configuration with every optional setting unset.
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_wait: None,
            send_timeout: None,
            request_timeout: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Parse a bounded duration in whole seconds.
fn parse_secs<F>(lookup: &F, env_var: &str, min: u64, max: u64) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(env_var) else {
        return Ok(None);
    };

    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if secs < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({}s)", secs, min),
        ));
    }

    if secs > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({}s)", secs, max),
        ));
    }

    Ok(Some(Duration::from_secs(secs)))
}

/// Parse batch size from the environment with validation.
fn parse_batch_size<F>(lookup: &F) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env_var = "DISPATCHER_BATCH_SIZE";

    let Some(value) = lookup(env_var) else {
        return Ok(DEFAULT_BATCH_SIZE);
    };

    let batch_size: usize = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if batch_size == 0 {
        return Err(ConfigError::for_var(env_var, "batch size must be greater than 0"));
    }

    if batch_size > MAX_BATCH_SIZE {
        return Err(ConfigError::for_var(
            env_var,
            format!(
                "batch size {} exceeds maximum allowed ({})",
                batch_size, MAX_BATCH_SIZE
            ),
        ));
    }

    Ok(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint, None);
        assert_eq!(config.batch_wait, None);
        assert_eq!(config.send_timeout, None);
        assert_eq!(config.batch_size, 20);
    }

    #[test]
    fn test_config_with_nothing_set() {
        let config = load(&[]).expect("Should load with defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_custom_values() {
        let config = load(&[
            ("DISPATCHER_ENDPOINT", "http://collector:9000/batch/"),
            ("DISPATCHER_BATCH_WAIT_SECS", "30"),
            ("DISPATCHER_SEND_TIMEOUT_SECS", "10"),
            ("DISPATCHER_REQUEST_TIMEOUT_SECS", "8"),
            ("DISPATCHER_BATCH_SIZE", "50"),
        ])
        .expect("Should load custom values");

        assert_eq!(config.endpoint.as_deref(), Some("http://collector:9000/batch/"));
        assert_eq!(config.batch_wait, Some(Duration::from_secs(30)));
        assert_eq!(config.send_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(8)));
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_endpoint_kept_verbatim() {
        let config = load(&[("DISPATCHER_ENDPOINT", " https://collector.test/batch/?k=v ")]).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("https://collector.test/batch/?k=v"));
    }

    #[test]
    fn test_blank_endpoint_is_unset() {
        let config = load(&[("DISPATCHER_ENDPOINT", "  ")]).unwrap();
        assert_eq!(config.endpoint, None);
    }

    #[test]
    fn test_invalid_batch_size() {
        let err = load(&[("DISPATCHER_BATCH_SIZE", "not_a_number")]).unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(err.env_var.as_deref(), Some("DISPATCHER_BATCH_SIZE"));
    }

    #[test]
    fn test_zero_batch_size() {
        let err = load(&[("DISPATCHER_BATCH_SIZE", "0")]).unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let err = load(&[("DISPATCHER_BATCH_SIZE", "99999")]).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_batch_wait_below_min() {
        let err = load(&[("DISPATCHER_BATCH_WAIT_SECS", "0")]).unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_send_timeout_exceeds_max() {
        let err = load(&[("DISPATCHER_SEND_TIMEOUT_SECS", "999")]).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
        assert_eq!(err.env_var.as_deref(), Some("DISPATCHER_SEND_TIMEOUT_SECS"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
