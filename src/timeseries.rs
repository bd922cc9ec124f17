//! Time-series publishing to InfluxDB.
//!
//! Every successful poll becomes one line-protocol point written through a
//! [`PointSink`]. Writes are independent: a rejected point is logged, counted,
//! and dropped without affecting the other devices or the metrics endpoint.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::collector::PollResult;
use crate::config::InfluxConfig;

/// Measurement name for device telemetry points.
pub const MEASUREMENT: &str = "tapo_metrics";

/// Errors that can occur while writing to the time-series sink.
#[derive(Debug)]
pub enum PublishError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server rejected the write
    Status { code: StatusCode, message: String },

    /// Request timeout
    Timeout,

    /// Sink configuration error
    Config(String),

    /// The write task was cancelled or panicked
    Aborted(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Request(e) => write!(f, "HTTP request failed: {}", e),
            PublishError::Status { code, message } => {
                write!(f, "Write rejected ({}): {}", code, message)
            }
            PublishError::Timeout => write!(f, "Write timed out"),
            PublishError::Config(e) => write!(f, "Sink configuration error: {}", e),
            PublishError::Aborted(e) => write!(f, "Write aborted: {}", e),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PublishError::Timeout
        } else {
            PublishError::Request(err)
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
        }
    }
}

/// A single time-series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn field_value(&self, key: &str) -> Option<FieldValue> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Build the telemetry point for a successful poll.
    ///
    /// Returns `None` for failed polls; a missing point is how the sink
    /// observes a failure.
    pub fn from_poll(result: &PollResult) -> Option<Self> {
        let reading = result.reading()?;
        let s = &reading.snapshot;
        let int = |v: u64| FieldValue::Integer(i64::try_from(v).unwrap_or(i64::MAX));
        let flag = |v: bool| FieldValue::Integer(i64::from(v));

        let mut point = Point::new(MEASUREMENT, result.timestamp)
            .tag("device_name", result.device.name.as_str())
            .tag("device_type", result.device.kind.label())
            .field("power_watts", FieldValue::Float(s.power_watts))
            .field("voltage_volts", FieldValue::Float(s.voltage_volts))
            .field("current_amps", FieldValue::Float(s.current_amps));

        if let Some(current) = reading.calculated_current_amps {
            point = point.field("calculated_current_amps", FieldValue::Float(current));
        }

        Some(
            point
                .field("today_energy_wh", int(s.energy_today_wh))
                .field("month_energy_wh", int(s.energy_month_wh))
                .field("power_saved_wh", int(s.power_saved_wh))
                .field("today_runtime_minutes", int(s.runtime_today_min))
                .field("month_runtime_minutes", int(s.runtime_month_min))
                .field("runtime_seconds", int(s.runtime_seconds))
                .field("power_protection_status", flag(s.protection.power_protection))
                .field("overcurrent_status", flag(s.protection.overcurrent))
                .field("overheat_status", flag(s.protection.overheat))
                .field(
                    "signal_strength",
                    FieldValue::Integer(i64::from(s.signal.strength_level)),
                )
                .field("signal_rssi", FieldValue::Integer(i64::from(s.signal.rssi))),
        )
    }

    /// Encode as InfluxDB line protocol with millisecond precision.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), value))
            .collect();
        line.push_str(&fields.join(","));

        line.push(' ');
        line.push_str(&self.timestamp.timestamp_millis().to_string());
        line
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Destination for time-series points.
#[async_trait]
pub trait PointSink: Send + Sync + 'static {
    async fn write(&self, point: &Point) -> Result<(), PublishError>;
}

/// InfluxDB v2 write API client.
///
/// The underlying HTTP client is built once and reused, so connections are
/// pooled for the lifetime of the process.
pub struct InfluxWriter {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Full URL of the `/api/v2/write` endpoint
    write_url: String,

    token: String,
    org: String,
    bucket: String,
    timeout: Duration,
}

impl InfluxWriter {
    /// Create a new writer for the given InfluxDB target.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Config` if the HTTP client cannot be built.
    pub fn new(config: &InfluxConfig) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| PublishError::Config(e.to_string()))?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            timeout: config.request_timeout,
        })
    }

    /// Get the configured write URL.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write(&self, point: &Point) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .timeout(self.timeout)
            .body(point.to_line_protocol())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(PublishError::Status {
            code: status,
            message,
        })
    }
}

/// Statistics about time-series writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishStats {
    /// Points accepted by the sink
    pub points_written: u64,

    /// Points rejected or lost in transit
    pub points_failed: u64,

    /// Failed polls for which no point was written
    pub devices_skipped: u64,
}

/// A point that could not be written.
#[derive(Debug)]
pub struct PublishFailure {
    pub device: String,
    pub error: PublishError,
}

/// Outcome of publishing one cycle.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub written: usize,

    /// Devices whose poll failed, with the poll error
    pub skipped: Vec<(String, String)>,

    pub failures: Vec<PublishFailure>,
}

impl PublishReport {
    /// Whether every device produced a point and every point was accepted.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failures.is_empty()
    }
}

/// Converts poll results into points and writes them to a sink.
pub struct TimeSeriesPublisher {
    sink: Arc<dyn PointSink>,
    stats: RwLock<PublishStats>,
}

impl TimeSeriesPublisher {
    pub fn new(sink: Arc<dyn PointSink>) -> Self {
        Self {
            sink,
            stats: RwLock::new(PublishStats::default()),
        }
    }

    /// Publish one cycle's results.
    ///
    /// Every point is written concurrently and independently, so a slow or
    /// failing write never delays the others. Failed polls and failed writes
    /// are reported, never retried. Dropping the returned future aborts the
    /// writes still in flight.
    pub async fn publish(&self, results: &[PollResult]) -> PublishReport {
        let mut report = PublishReport::default();
        let mut writes = JoinSet::new();
        let mut devices = Vec::new();

        for result in results {
            let Some(point) = Point::from_poll(result) else {
                if let Some(e) = result.error() {
                    report
                        .skipped
                        .push((result.device.name.clone(), e.to_string()));
                }
                continue;
            };

            let index = devices.len();
            devices.push(result.device.name.clone());
            let sink = Arc::clone(&self.sink);
            writes.spawn(async move { (index, sink.write(&point).await) });
        }

        let mut outcomes: Vec<Option<Result<(), PublishError>>> =
            devices.iter().map(|_| None).collect();

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Point write task did not complete"),
            }
        }

        for (device, outcome) in devices.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                Err(PublishError::Aborted("write task panicked".to_string()))
            });

            match outcome {
                Ok(()) => {
                    debug!(device = %device, "Wrote point");
                    report.written += 1;
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to write point, dropping it");
                    report.failures.push(PublishFailure { device, error: e });
                }
            }
        }

        {
            let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
            stats.points_written += report.written as u64;
            stats.points_failed += report.failures.len() as u64;
            stats.devices_skipped += report.skipped.len() as u64;
        }

        info!(
            written = report.written,
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Published cycle to time-series sink"
        );

        report
    }

    /// Get current publishing statistics.
    pub fn stats(&self) -> PublishStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
