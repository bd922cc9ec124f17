//! Device model for the Tapo exporter.
//!
//! This module defines the device descriptors loaded from configuration, the
//! canonical telemetry snapshot read from a plug, and the `DeviceClient`
//! capability that performs the actual fetch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supported smart-plug models.
///
/// The kind only affects labeling; every kind is fetched through the same
/// `DeviceClient` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    P110,
    P115,
}

impl DeviceKind {
    /// Get all supported device kinds.
    pub fn all() -> &'static [DeviceKind] {
        &[DeviceKind::P110, DeviceKind::P115]
    }

    /// Label value used for the `device_type` label and tag.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::P110 => "p110",
            DeviceKind::P115 => "p115",
        }
    }

    /// Parse a device kind, ignoring case and surrounding whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.label().eq_ignore_ascii_case(value))
    }

    /// The other plug model sharing the same energy-monitoring API.
    pub fn alternative(&self) -> Self {
        match self {
            DeviceKind::P110 => DeviceKind::P115,
            DeviceKind::P115 => DeviceKind::P110,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Account credentials used to authenticate with a device.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Passwords must never reach the logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// A configured device. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Unique name, used as the `device_name` label and tag
    pub name: String,

    /// Device model
    pub kind: DeviceKind,

    /// Network address (IP or hostname)
    pub address: String,

    /// Credentials for the device's cloud account
    pub credentials: Credentials,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: DeviceKind,
        address: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            address: address.into(),
            credentials,
        }
    }
}

/// Protection circuit state reported by the plug. `true` means tripped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionFlags {
    pub overcurrent: bool,
    pub overheat: bool,
    pub power_protection: bool,
}

impl ProtectionFlags {
    /// Whether no protection circuit is tripped.
    pub fn all_clear(&self) -> bool {
        !(self.overcurrent || self.overheat || self.power_protection)
    }
}

/// Wi-Fi signal indicators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Signal bars as reported by the device (0-3)
    pub strength_level: u8,

    /// Received signal strength in dBm (negative)
    pub rssi: i32,
}

/// Raw telemetry read from one device at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub power_watts: f64,
    pub voltage_volts: f64,
    pub current_amps: f64,
    pub energy_today_wh: u64,
    pub energy_month_wh: u64,
    pub power_saved_wh: u64,
    pub runtime_today_min: u64,
    pub runtime_month_min: u64,
    /// Seconds since the relay was last switched on
    pub runtime_seconds: u64,
    pub protection: ProtectionFlags,
    pub signal: SignalInfo,
}

impl Snapshot {
    /// Check that every analog reading is a finite, non-negative number.
    pub fn validate(&self) -> Result<(), DeviceError> {
        let analog = [
            ("power_watts", self.power_watts),
            ("voltage_volts", self.voltage_volts),
            ("current_amps", self.current_amps),
        ];

        for (field, value) in analog {
            if !value.is_finite() || value < 0.0 {
                return Err(DeviceError::InvalidResponse(format!(
                    "{} has invalid value {}",
                    field, value
                )));
            }
        }

        Ok(())
    }

    /// Current derived from power and voltage.
    ///
    /// Returns `None` when the device reports no voltage, so a zero reading
    /// never turns into an infinite or NaN gauge.
    pub fn calculated_current_amps(&self) -> Option<f64> {
        if self.voltage_volts > 0.0 {
            Some(self.power_watts / self.voltage_volts)
        } else {
            None
        }
    }
}

/// Errors that can occur while fetching telemetry from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The fetch did not complete within the per-device timeout
    Timeout(Duration),

    /// The device or cloud account rejected the credentials
    Authentication(String),

    /// Connection refused, reset, or unreachable
    Transport(String),

    /// The device answered with data that could not be normalized
    InvalidResponse(String),

    /// The fetch task was cancelled or panicked
    Aborted(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Timeout(after) => {
                write!(f, "Device did not respond within {}ms", after.as_millis())
            }
            DeviceError::Authentication(e) => write!(f, "Authentication failed: {}", e),
            DeviceError::Transport(e) => write!(f, "Transport error: {}", e),
            DeviceError::InvalidResponse(e) => write!(f, "Invalid device response: {}", e),
            DeviceError::Aborted(e) => write!(f, "Fetch aborted: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Capability that reads one telemetry snapshot from a device.
///
/// Implementations own their connection and authentication lifecycle
/// (session caching, re-login); the collector only sees a snapshot or an
/// error. Calls for different devices run concurrently.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    async fn fetch(&self, device: &DeviceDescriptor) -> Result<Snapshot, DeviceError>;
}
