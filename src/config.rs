use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// What to do when an `open` message arrives without usable parameters
/// (unparseable parameters or an empty media list).
///
/// `Idle` leaves the connection open and waiting, which matches the upstream
/// protocol's best-effort control-channel semantics; `Disconnect` actively
/// sends a `disconnect` reply and tears the session down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFailurePolicy {
    Idle,
    Disconnect,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub open_failure_policy: OpenFailurePolicy,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let policy_str =
            std::env::var("OPEN_FAILURE_POLICY").unwrap_or_else(|_| "idle".to_string());
        let open_failure_policy = match policy_str.to_lowercase().as_str() {
            "idle" => OpenFailurePolicy::Idle,
            "disconnect" => OpenFailurePolicy::Disconnect,
            other => {
                return Err(ConfigError::InvalidValue(
                    "OPEN_FAILURE_POLICY".to_string(),
                    format!("'{}' is not 'idle' or 'disconnect'", other),
                ));
            }
        };

        let grace_str =
            std::env::var("SHUTDOWN_GRACE_MS").unwrap_or_else(|_| "10000".to_string());
        let grace_ms = grace_str.parse::<u64>().map_err(|e| {
            ConfigError::InvalidValue("SHUTDOWN_GRACE_MS".to_string(), e.to_string())
        })?;

        Ok(Self {
            bind_address,
            log_level,
            open_failure_policy,
            shutdown_grace: Duration::from_millis(grace_ms),
        })
    }
}
