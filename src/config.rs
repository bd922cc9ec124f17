//! Configuration module for the Tapo exporter.
//!
//! This module provides environment-based configuration for the exporter
//! process: poll cadence, timeouts, the metrics port, and the InfluxDB write
//! target. The device list itself is loaded by [`crate::registry`].

use std::env;
use std::time::Duration;

/// Default poll interval in seconds
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Default per-device fetch timeout in seconds
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default grace period for an in-flight cycle at shutdown
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Default port for the metrics exposition server
const DEFAULT_METRICS_PORT: u16 = 8000;

/// Default InfluxDB URL
const DEFAULT_INFLUXDB_URL: &str = "http://influxdb:8086";

/// Default InfluxDB organization and bucket
const DEFAULT_INFLUXDB_ORG: &str = "tapo";
const DEFAULT_INFLUXDB_BUCKET: &str = "tapo";

/// Default InfluxDB write timeout in seconds
const DEFAULT_INFLUXDB_TIMEOUT_SECS: u64 = 10;

/// Default electricity price per kWh
const DEFAULT_COST_PER_KWH: f64 = 0.12;

const MIN_POLL_INTERVAL_SECS: u64 = 1;
const MAX_POLL_INTERVAL_SECS: u64 = 3600;
const MIN_FETCH_TIMEOUT_SECS: u64 = 1;
const MAX_FETCH_TIMEOUT_SECS: u64 = 300;
const MAX_SHUTDOWN_GRACE_SECS: u64 = 300;

/// InfluxDB v2 write target.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL of the InfluxDB server, without trailing slash
    pub url: String,

    /// API token sent as `Authorization: Token <token>`
    pub token: String,

    /// Organization name
    pub org: String,

    /// Destination bucket
    pub bucket: String,

    /// Timeout for a single write request
    pub request_timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_INFLUXDB_URL.to_string(),
            token: String::new(),
            org: DEFAULT_INFLUXDB_ORG.to_string(),
            bucket: DEFAULT_INFLUXDB_BUCKET.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_INFLUXDB_TIMEOUT_SECS),
        }
    }
}

/// Configuration for the Tapo exporter.
///
/// All settings can be configured via environment variables:
/// - `TAPO_POLL_INTERVAL_SECS`: Seconds between poll cycles (default: 2)
/// - `TAPO_FETCH_TIMEOUT_SECS`: Per-device fetch timeout (default: 10)
/// - `TAPO_SHUTDOWN_GRACE_SECS`: Grace period for the in-flight cycle (default: 5)
/// - `PROMETHEUS_PORT`: Metrics exposition port (default: 8000)
/// - `INFLUXDB_URL`, `INFLUXDB_TOKEN`, `INFLUXDB_ORG`, `INFLUXDB_BUCKET`
/// - `INFLUXDB_TIMEOUT_SECS`: Write request timeout (default: 10)
/// - `COST_PER_KWH`: Electricity price, passed through to dashboards (default: 0.12)
/// - `TAPO_SIMULATE`: Poll simulated plugs instead of real devices (default: false)
/// - `TAPO_SIMULATION_FAILURE_RATE`: Failure rate of the simulated client (default: 0)
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed interval between poll cycles
    pub poll_interval: Duration,

    /// Upper bound on a single device fetch
    pub fetch_timeout: Duration,

    /// How long an in-flight cycle may run after shutdown is requested
    pub shutdown_grace: Duration,

    /// Port for the `/metrics` endpoint
    pub metrics_port: u16,

    /// Time-series sink settings
    pub influx: InfluxConfig,

    /// Electricity price per kWh (consumed by dashboards only)
    pub cost_per_kwh: f64,

    /// Use the simulated client instead of talking to real plugs
    pub simulate: bool,

    /// Probability that a simulated device fetch fails
    pub simulation_failure_rate: f64,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: None,
        }
    }

    pub(crate) fn for_var(env_var: &str, message: impl Into<String>) -> Self {
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
    /// Returns `ConfigError` if a variable is set but is not a valid number or
    /// falls outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tapo_exporter::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Polling every {:?}", config.poll_interval);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let poll_interval = Duration::from_secs(parse_bounded(
            &lookup,
            "TAPO_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
            MIN_POLL_INTERVAL_SECS,
            MAX_POLL_INTERVAL_SECS,
        )?);

        let fetch_timeout = Duration::from_secs(parse_bounded(
            &lookup,
            "TAPO_FETCH_TIMEOUT_SECS",
            DEFAULT_FETCH_TIMEOUT_SECS,
            MIN_FETCH_TIMEOUT_SECS,
            MAX_FETCH_TIMEOUT_SECS,
        )?);

        let shutdown_grace = Duration::from_secs(parse_bounded(
            &lookup,
            "TAPO_SHUTDOWN_GRACE_SECS",
            DEFAULT_SHUTDOWN_GRACE_SECS,
            0,
            MAX_SHUTDOWN_GRACE_SECS,
        )?);

        let metrics_port = Self::parse_port(&lookup)?;

        // Normalize the InfluxDB URL
        let url = lookup("INFLUXDB_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_INFLUXDB_URL.to_string());

        let influx = InfluxConfig {
            url,
            token: lookup("INFLUXDB_TOKEN").unwrap_or_default(),
            org: lookup("INFLUXDB_ORG").unwrap_or_else(|| DEFAULT_INFLUXDB_ORG.to_string()),
            bucket: lookup("INFLUXDB_BUCKET")
                .unwrap_or_else(|| DEFAULT_INFLUXDB_BUCKET.to_string()),
            request_timeout: Duration::from_secs(parse_bounded(
                &lookup,
                "INFLUXDB_TIMEOUT_SECS",
                DEFAULT_INFLUXDB_TIMEOUT_SECS,
                1,
                MAX_FETCH_TIMEOUT_SECS,
            )?),
        };

        let cost_per_kwh = parse_fraction(&lookup, "COST_PER_KWH", DEFAULT_COST_PER_KWH, None)?;
        let simulate = parse_flag(&lookup, "TAPO_SIMULATE", false)?;
        let simulation_failure_rate =
            parse_fraction(&lookup, "TAPO_SIMULATION_FAILURE_RATE", 0.0, Some(1.0))?;

        Ok(Self {
            poll_interval,
            fetch_timeout,
            shutdown_grace,
            metrics_port,
            influx,
            cost_per_kwh,
            simulate,
            simulation_failure_rate,
        })
    }

    /// Parse the metrics port with validation.
    fn parse_port<F>(lookup: &F) -> Result<u16, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = "PROMETHEUS_PORT";

        match lookup(env_var) {
            Some(value) => {
                let port: u16 = value.trim().parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid port", value))
                })?;

                if port == 0 {
                    return Err(ConfigError::for_var(env_var, "port must be greater than 0"));
                }

                Ok(port)
            }
            None => Ok(DEFAULT_METRICS_PORT),
        }
    }
}

/// Parse an integer variable and check it against an inclusive range.
pub(crate) fn parse_bounded<F>(
    lookup: &F,
    env_var: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    let parsed: u64 = value.trim().parse().map_err(|_| {
        ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
    })?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

/// Parse a boolean variable (`true`/`false`, `1`/`0`, `yes`/`no`).
fn parse_flag<F>(lookup: &F, env_var: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::for_var(
            env_var,
            format!("'{}' is not a valid boolean", value),
        )),
    }
}

/// Parse a non-negative float variable with an optional upper bound.
fn parse_fraction<F>(
    lookup: &F,
    env_var: &str,
    default: f64,
    max: Option<f64>,
) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    let parsed: f64 = value.trim().parse().map_err(|_| {
        ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
    })?;

    if !parsed.is_finite() || parsed < 0.0 {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} must be a non-negative number", parsed),
        ));
    }

    if let Some(max) = max {
        if parsed > max {
            return Err(ConfigError::for_var(
                env_var,
                format!("{} exceeds maximum ({})", parsed, max),
            ));
        }
    }

    Ok(parsed)
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            metrics_port: DEFAULT_METRICS_PORT,
            influx: InfluxConfig::default(),
            cost_per_kwh: DEFAULT_COST_PER_KWH,
            simulate: false,
            simulation_failure_rate: 0.0,
        }
    }
}
