//! Device registry.
//!
//! The registry is the immutable, ordered list of devices the exporter polls.
//! It is loaded once at startup; an empty or inconsistent list is a fatal
//! configuration error.

use std::collections::HashSet;
use std::env;

use tracing::{debug, info, warn};

use crate::config::{parse_bounded, ConfigError};
use crate::device::{Credentials, DeviceDescriptor, DeviceKind};

/// Upper bound for `TAPO_DEVICE_COUNT`
const MAX_DEVICE_COUNT: u64 = 256;

/// Ordered, non-empty set of uniquely named devices.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceRegistry {
    /// Build a registry from an explicit device list.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the list is empty or two devices share a name.
    pub fn new(devices: Vec<DeviceDescriptor>) -> Result<Self, ConfigError> {
        if devices.is_empty() {
            return Err(ConfigError::new("no devices configured"));
        }

        let mut seen = HashSet::with_capacity(devices.len());
        for device in &devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::new(format!(
                    "device at {} has an empty name",
                    device.address
                )));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::new(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }

        Ok(Self { devices })
    }

    /// Load the registry from environment variables.
    ///
    /// Two formats are supported. The shared-credential format uses
    /// `TAPO_USERNAME`, `TAPO_PASSWORD` and a comma-separated `TAPO_DEVICES`
    /// address list. Otherwise devices are read from `TAPO_DEVICE_COUNT` and
    /// `TAPO_DEVICE_{i}_NAME`, `_IP`, `_EMAIL`, `_PASSWORD`, `_TYPE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the registry through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let devices = match (
            lookup("TAPO_USERNAME"),
            lookup("TAPO_PASSWORD"),
            lookup("TAPO_DEVICES"),
        ) {
            (Some(username), Some(password), Some(addresses)) => {
                debug!("Using shared-credential device format");
                shared_credential_devices(&username, &password, &addresses)
            }
            _ => {
                debug!("Using indexed device format");
                indexed_devices(&lookup)?
            }
        };

        let registry = Self::new(devices)?;
        info!(device_count = registry.len(), "Device registry loaded");
        Ok(registry)
    }

    /// Configured devices in configuration order.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn shared_credential_devices(
    username: &str,
    password: &str,
    addresses: &str,
) -> Vec<DeviceDescriptor> {
    addresses
        .split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(|ip| {
            let name = format!("tapo_{}", ip.replace('.', "_"));
            info!(device = %name, address = %ip, kind = %DeviceKind::P110, "Added device");
            DeviceDescriptor::new(
                name,
                DeviceKind::P110,
                ip,
                Credentials::new(username, password),
            )
        })
        .collect()
}

fn indexed_devices<F>(lookup: &F) -> Result<Vec<DeviceDescriptor>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let count = parse_bounded(lookup, "TAPO_DEVICE_COUNT", 0, 0, MAX_DEVICE_COUNT)?;

    let mut devices = Vec::new();

    for i in 1..=count {
        let field = |suffix: &str| lookup(&format!("TAPO_DEVICE_{}_{}", i, suffix));

        let (Some(name), Some(ip), Some(email), Some(password)) =
            (field("NAME"), field("IP"), field("EMAIL"), field("PASSWORD"))
        else {
            let missing: Vec<&str> = ["NAME", "IP", "EMAIL", "PASSWORD"]
                .into_iter()
                .filter(|&suffix| field(suffix).is_none())
                .collect();
            warn!(index = i, missing = ?missing, "Missing configuration for device, skipping");
            continue;
        };

        let kind = match field("TYPE") {
            None => DeviceKind::P110,
            Some(raw) => DeviceKind::parse(&raw).unwrap_or_else(|| {
                warn!(index = i, device_type = %raw, "Unknown device type, using p110");
                DeviceKind::P110
            }),
        };

        info!(device = %name, address = %ip, kind = %kind, "Added device");
        devices.push(DeviceDescriptor::new(
            name.trim(),
            kind,
            ip.trim(),
            Credentials::new(email, password),
        ));
    }

    Ok(devices)
}
