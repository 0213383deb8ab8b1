//! Configuration module for the observation spooler.
//!
//! This module provides environment-based configuration for the spooler,
//! including the SensorThings endpoint, credentials, spool database path,
//! and sampling/transmission cadence settings.

use std::env;
use std::time::Duration;

use crate::sampler::SensorKind;

/// Default path of the spool database file
const DEFAULT_DB_PATH: &str = "observations.sqlite3";

/// Default base URL of the SensorThings API
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Default seconds between sensor sampling ticks
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 60;

/// Default seconds between delivery cycles
const DEFAULT_TRANSMIT_INTERVAL_SECS: u64 = 15;

/// Default number of pending observations drained per delivery cycle
const DEFAULT_BATCH_LIMIT: usize = 360;

/// Maximum allowed batch limit to keep request bodies bounded
const MAX_BATCH_LIMIT: usize = 10_000;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default seconds a bearer token is reused before re-authenticating.
/// Must stay below the server-enforced token expiry.
const DEFAULT_AUTH_TTL_SECS: u64 = 300;

/// Default sensor set
const DEFAULT_SENSORS: &str = "ozone";

/// Default Datastream id for the ozone sampler
const DEFAULT_OZONE_STREAM_ID: &str = "ozone-ppb";

/// Default MultiDatastream id for the climate sampler
const DEFAULT_CLIMATE_STREAM_ID: &str = "climate-temp-rh";

const MIN_SAMPLE_INTERVAL_SECS: u64 = 1;
const MAX_SAMPLE_INTERVAL_SECS: u64 = 86_400;
const MIN_TRANSMIT_INTERVAL_SECS: u64 = 1;
const MAX_TRANSMIT_INTERVAL_SECS: u64 = 3_600;
const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;
const MIN_AUTH_TTL_SECS: u64 = 1;
const MAX_AUTH_TTL_SECS: u64 = 86_400;

/// Configuration for the observation spooler.
///
/// All settings can be configured via environment variables:
/// - `OBS_SPOOLER_DB_PATH`: spool database path (default: observations.sqlite3)
/// - `OBS_SPOOLER_BASE_URL`: SensorThings API base URL (default: http://localhost:8080)
/// - `OBS_SPOOLER_AUTH_URL`: login endpoint URL (required)
/// - `OBS_SPOOLER_CLIENT_ID`: login client id (required)
/// - `OBS_SPOOLER_CLIENT_KEY`: login client key (required)
/// - `OBS_SPOOLER_FOI_ID`: feature-of-interest id attached to samples (optional)
/// - `OBS_SPOOLER_SAMPLE_INTERVAL_SECS`: seconds between samples (default: 60)
/// - `OBS_SPOOLER_TRANSMIT_INTERVAL_SECS`: seconds between delivery cycles (default: 15)
/// - `OBS_SPOOLER_BATCH_LIMIT`: observations per delivery cycle (default: 360)
/// - `OBS_SPOOLER_REQUEST_TIMEOUT_SECS`: HTTP timeout (default: 30)
/// - `OBS_SPOOLER_AUTH_TTL_SECS`: token reuse window (default: 300)
/// - `OBS_SPOOLER_VERIFY_TLS`: verify server certificates (default: true)
/// - `OBS_SPOOLER_SANITIZE_RESULTS`: send non-finite numbers as null (default: true)
/// - `OBS_SPOOLER_SENSORS`: comma list of `ozone`, `climate` (default: ozone)
/// - `OBS_SPOOLER_OZONE_STREAM_ID`: Datastream id for ozone readings
/// - `OBS_SPOOLER_CLIMATE_STREAM_ID`: MultiDatastream id for climate readings
/// - `OBS_SPOOLER_AVERAGE_STREAM_ID`: MultiDatastream id averaged before sending (optional)
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite spool database
    pub db_path: String,

    /// Base URL of the SensorThings API
    pub base_url: String,

    /// Full URL for the batch observation endpoint
    pub create_url: String,

    /// Full URL for the token login endpoint
    pub auth_url: String,

    /// Client id presented at login
    pub client_id: String,

    /// Client key presented at login
    pub client_key: String,

    /// Feature-of-interest id stamped onto sampled observations
    pub feature_of_interest_id: Option<String>,

    /// Duration between sensor sampling ticks
    pub sample_interval: Duration,

    /// Duration between delivery cycles
    pub transmit_interval: Duration,

    /// Maximum pending observations drained per delivery cycle
    pub batch_limit: usize,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Duration a bearer token is reused before re-authenticating
    pub auth_ttl: Duration,

    /// Whether to verify server TLS certificates
    pub verify_tls: bool,

    /// Whether non-finite numeric results are sent as JSON null
    pub sanitize_results: bool,

    /// Sensors to run
    pub sensors: Vec<SensorKind>,

    /// Datastream id receiving ozone readings
    pub ozone_stream_id: String,

    /// MultiDatastream id receiving climate readings
    pub climate_stream_id: String,

    /// MultiDatastream id whose pending rows are averaged into one element
    pub average_stream_id: Option<String>,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
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
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to sensible defaults where appropriate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `OBS_SPOOLER_AUTH_URL`, `OBS_SPOOLER_CLIENT_ID` or
    ///   `OBS_SPOOLER_CLIENT_KEY` is missing or empty
    /// - a numeric variable is not a valid number or exceeds its limits
    /// - `OBS_SPOOLER_SENSORS` names an unknown sensor kind
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use obs_spooler::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Posting to: {}", config.create_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = Self::db_path_from_env();

        // Validate and normalize the API base URL
        let base_url =
            env::var("OBS_SPOOLER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let base_url = base_url.trim_end_matches('/').to_string();

        // Construct full batch endpoint URL
        let create_url = format!("{}/CreateObservations", base_url);

        let auth_url = Self::require_var("OBS_SPOOLER_AUTH_URL")?;
        let client_id = Self::require_var("OBS_SPOOLER_CLIENT_ID")?;
        let client_key = Self::require_var("OBS_SPOOLER_CLIENT_KEY")?;

        let feature_of_interest_id = Self::optional_var("OBS_SPOOLER_FOI_ID");

        let sample_interval = Duration::from_secs(Self::parse_secs(
            "OBS_SPOOLER_SAMPLE_INTERVAL_SECS",
            "sample interval",
            DEFAULT_SAMPLE_INTERVAL_SECS,
            MIN_SAMPLE_INTERVAL_SECS,
            MAX_SAMPLE_INTERVAL_SECS,
        )?);

        let transmit_interval = Duration::from_secs(Self::parse_secs(
            "OBS_SPOOLER_TRANSMIT_INTERVAL_SECS",
            "transmit interval",
            DEFAULT_TRANSMIT_INTERVAL_SECS,
            MIN_TRANSMIT_INTERVAL_SECS,
            MAX_TRANSMIT_INTERVAL_SECS,
        )?);

        let batch_limit = Self::parse_batch_limit()?;

        let request_timeout = Duration::from_secs(Self::parse_secs(
            "OBS_SPOOLER_REQUEST_TIMEOUT_SECS",
            "request timeout",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            MIN_REQUEST_TIMEOUT_SECS,
            MAX_REQUEST_TIMEOUT_SECS,
        )?);

        let auth_ttl = Duration::from_secs(Self::parse_secs(
            "OBS_SPOOLER_AUTH_TTL_SECS",
            "auth ttl",
            DEFAULT_AUTH_TTL_SECS,
            MIN_AUTH_TTL_SECS,
            MAX_AUTH_TTL_SECS,
        )?);

        let verify_tls = Self::parse_bool("OBS_SPOOLER_VERIFY_TLS", true)?;
        let sanitize_results = Self::parse_bool("OBS_SPOOLER_SANITIZE_RESULTS", true)?;

        let sensors = Self::parse_sensors()?;

        let ozone_stream_id = env::var("OBS_SPOOLER_OZONE_STREAM_ID")
            .unwrap_or_else(|_| DEFAULT_OZONE_STREAM_ID.to_string());
        let climate_stream_id = env::var("OBS_SPOOLER_CLIMATE_STREAM_ID")
            .unwrap_or_else(|_| DEFAULT_CLIMATE_STREAM_ID.to_string());
        let average_stream_id = Self::optional_var("OBS_SPOOLER_AVERAGE_STREAM_ID");

        Ok(Self {
            db_path,
            base_url,
            create_url,
            auth_url,
            client_id,
            client_key,
            feature_of_interest_id,
            sample_interval,
            transmit_interval,
            batch_limit,
            request_timeout,
            auth_ttl,
            verify_tls,
            sanitize_results,
            sensors,
            ozone_stream_id,
            climate_stream_id,
            average_stream_id,
        })
    }

    /// Read just the spool database path.
    ///
    /// Maintenance commands operate on the local database only and must not
    /// require the delivery credentials, so they bypass `from_env`.
    pub fn db_path_from_env() -> String {
        env::var("OBS_SPOOLER_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
    }

    /// Read a required variable, rejecting empty values.
    fn require_var(env_var: &str) -> Result<String, ConfigError> {
        match env::var(env_var) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(ConfigError {
                message: "must be set".to_string(),
                env_var: Some(env_var.to_string()),
            }),
        }
    }

    /// Read an optional variable, treating empty values as unset.
    fn optional_var(env_var: &str) -> Option<String> {
        env::var(env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse a seconds value from an environment variable with validation.
    fn parse_secs(
        env_var: &str,
        label: &str,
        default: u64,
        min: u64,
        max: u64,
    ) -> Result<u64, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if secs < min {
                    return Err(ConfigError {
                        message: format!("{} {} is below minimum ({}s)", label, secs, min),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if secs > max {
                    return Err(ConfigError {
                        message: format!("{} {} exceeds maximum ({}s)", label, secs, max),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(secs)
            }
            Err(_) => Ok(default),
        }
    }

    /// Parse the batch limit from its environment variable with validation.
    fn parse_batch_limit() -> Result<usize, ConfigError> {
        let env_var = "OBS_SPOOLER_BATCH_LIMIT";

        match env::var(env_var) {
            Ok(value) => {
                let batch_limit: usize = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if batch_limit == 0 {
                    return Err(ConfigError {
                        message: "batch limit must be greater than 0".to_string(),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if batch_limit > MAX_BATCH_LIMIT {
                    return Err(ConfigError {
                        message: format!(
                            "batch limit {} exceeds maximum allowed ({})",
                            batch_limit, MAX_BATCH_LIMIT
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(batch_limit)
            }
            Err(_) => Ok(DEFAULT_BATCH_LIMIT),
        }
    }

    /// Parse a boolean flag from an environment variable.
    fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError {
                    message: format!("'{}' is not a valid boolean", value),
                    env_var: Some(env_var.to_string()),
                }),
            },
            Err(_) => Ok(default),
        }
    }

    /// Parse the configured sensor kinds.
    fn parse_sensors() -> Result<Vec<SensorKind>, ConfigError> {
        let env_var = "OBS_SPOOLER_SENSORS";
        let value = env::var(env_var).unwrap_or_else(|_| DEFAULT_SENSORS.to_string());

        let mut sensors = Vec::new();
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = SensorKind::parse(name).ok_or_else(|| ConfigError {
                message: format!("unknown sensor kind '{}' (expected 'ozone' or 'climate')", name),
                env_var: Some(env_var.to_string()),
            })?;
            if !sensors.contains(&kind) {
                sensors.push(kind);
            }
        }

        if sensors.is_empty() {
            return Err(ConfigError {
                message: "at least one sensor must be configured".to_string(),
                env_var: Some(env_var.to_string()),
            });
        }

        Ok(sensors)
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            create_url: format!("{}/CreateObservations", DEFAULT_BASE_URL),
            auth_url: format!("{}/auth/login", DEFAULT_BASE_URL),
            client_id: "client".to_string(),
            client_key: "key".to_string(),
            feature_of_interest_id: None,
            sample_interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
            transmit_interval: Duration::from_secs(DEFAULT_TRANSMIT_INTERVAL_SECS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            auth_ttl: Duration::from_secs(DEFAULT_AUTH_TTL_SECS),
            verify_tls: true,
            sanitize_results: true,
            sensors: vec![SensorKind::Ozone],
            ozone_stream_id: DEFAULT_OZONE_STREAM_ID.to_string(),
            climate_stream_id: DEFAULT_CLIMATE_STREAM_ID.to_string(),
            average_stream_id: None,
        }
    }
}
