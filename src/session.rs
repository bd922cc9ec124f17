//! Session-caching device client for real Tapo plugs.
//!
//! [`SessionClient`] keeps one authenticated session per device and reuses it
//! across polls. A failed read drops the session so the next poll logs in
//! again. When a device cannot be reached as its configured model, the other
//! energy-monitoring model is tried before giving up.
//!
//! The protocol itself lives behind [`PlugConnector`]; [`TapoConnector`]
//! implements it with the `tapo` crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::device::{
    DeviceClient, DeviceDescriptor, DeviceError, DeviceKind, ProtectionFlags, SignalInfo,
    Snapshot,
};

/// Raw responses from one read of a plug, as JSON documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReading {
    /// Device info: protection status, signal, relay on-time
    pub device_info: Value,

    /// Instantaneous power (and voltage, when the firmware reports it)
    pub current_power: Value,

    /// Energy and runtime counters for today and this month
    pub energy_usage: Value,

    /// Usage breakdown by period, including saved power
    pub device_usage: Value,
}

/// An authenticated connection to one plug.
#[async_trait]
pub trait PlugSession: Send + Sync + 'static {
    async fn read(&self) -> Result<RawReading, DeviceError>;
}

/// Opens sessions to plugs.
#[async_trait]
pub trait PlugConnector: Send + Sync + 'static {
    type Session: PlugSession;

    async fn connect(
        &self,
        device: &DeviceDescriptor,
        kind: DeviceKind,
    ) -> Result<Self::Session, DeviceError>;
}

type SessionSlot<S> = Arc<Mutex<Option<S>>>;

/// `DeviceClient` that caches one session per device.
pub struct SessionClient<C: PlugConnector> {
    connector: C,
    sessions: StdMutex<HashMap<String, SessionSlot<C::Session>>>,
}

impl<C: PlugConnector> SessionClient<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, device: &str) -> SessionSlot<C::Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(device.to_string()).or_default())
    }

    /// Log in as the configured model, falling back to the other one.
    async fn connect(&self, device: &DeviceDescriptor) -> Result<C::Session, DeviceError> {
        let first = match self.connector.connect(device, device.kind).await {
            Ok(session) => {
                info!(device = %device.name, kind = %device.kind, "Connected to device");
                return Ok(session);
            }
            Err(e) => e,
        };

        let alternative = device.kind.alternative();
        warn!(
            device = %device.name,
            kind = %device.kind,
            error = %first,
            "Failed to connect, trying {}",
            alternative
        );

        match self.connector.connect(device, alternative).await {
            Ok(session) => {
                info!(device = %device.name, kind = %alternative, "Connected using alternative type");
                Ok(session)
            }
            Err(_) => Err(first),
        }
    }
}

#[async_trait]
impl<C: PlugConnector> DeviceClient for SessionClient<C> {
    async fn fetch(&self, device: &DeviceDescriptor) -> Result<Snapshot, DeviceError> {
        let slot = self.slot(&device.name);
        let mut cached = slot.lock().await;

        let session = match cached.take() {
            Some(session) => session,
            None => self.connect(device).await?,
        };

        match session.read().await {
            Ok(raw) => {
                *cached = Some(session);
                snapshot_from_raw(&raw)
            }
            Err(e) => {
                debug!(device = %device.name, "Dropping session after failed read");
                Err(e)
            }
        }
    }
}

/// Normalize raw plug responses into a snapshot.
///
/// Power is required; every other field defaults to zero when the firmware
/// omits it. Voltage is only present on some firmware, so a missing value
/// leaves the derived current undefined rather than guessed.
pub fn snapshot_from_raw(raw: &RawReading) -> Result<Snapshot, DeviceError> {
    if !raw.device_info.is_object() {
        return Err(DeviceError::InvalidResponse(
            "device info is not an object".to_string(),
        ));
    }

    let power_watts = match raw.current_power.get("current_power").and_then(Value::as_f64) {
        Some(watts) => watts,
        // Energy usage reports power in milliwatts
        None => raw
            .energy_usage
            .get("current_power")
            .and_then(Value::as_f64)
            .map(|mw| mw / 1000.0)
            .ok_or_else(|| {
                DeviceError::InvalidResponse("response has no current_power".to_string())
            })?,
    };

    let info = &raw.device_info;
    let usage = &raw.energy_usage;

    Ok(Snapshot {
        power_watts,
        voltage_volts: analog(raw.current_power.get("voltage")),
        current_amps: analog(raw.current_power.get("current")),
        energy_today_wh: counter(usage.get("today_energy")),
        energy_month_wh: counter(usage.get("month_energy")),
        power_saved_wh: counter(raw.device_usage.pointer("/saved_power/today")),
        runtime_today_min: counter(
            usage
                .get("today_runtime")
                .or_else(|| raw.device_usage.pointer("/time_usage/today")),
        ),
        runtime_month_min: counter(
            usage
                .get("month_runtime")
                .or_else(|| raw.device_usage.pointer("/time_usage/past30")),
        ),
        runtime_seconds: counter(info.get("on_time")),
        protection: ProtectionFlags {
            overcurrent: tripped(info.get("overcurrent_status")),
            overheat: tripped(info.get("overheat_status")),
            power_protection: tripped(info.get("power_protection_status")),
        },
        signal: SignalInfo {
            strength_level: counter(info.get("signal_level")).min(u64::from(u8::MAX)) as u8,
            rssi: info
                .get("rssi")
                .and_then(Value::as_i64)
                .map(|v| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
                .unwrap_or(0),
        },
    })
}

fn analog(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

fn counter(value: Option<&Value>) -> u64 {
    value
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

/// Protection status fields are `"normal"` unless tripped.
fn tripped(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(status)) => !status.eq_ignore_ascii_case("normal"),
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

/// `PlugConnector` backed by the `tapo` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TapoConnector;

/// An authenticated `tapo` energy-monitoring handler.
pub struct TapoSession {
    handler: tapo::PlugEnergyMonitoringHandler,
}

#[async_trait]
impl PlugConnector for TapoConnector {
    type Session = TapoSession;

    async fn connect(
        &self,
        device: &DeviceDescriptor,
        kind: DeviceKind,
    ) -> Result<TapoSession, DeviceError> {
        let client = tapo::ApiClient::new(
            device.credentials.username.clone(),
            device.credentials.password.clone(),
        );

        let handler = match kind {
            DeviceKind::P110 => client.p110(device.address.clone()).await,
            DeviceKind::P115 => client.p115(device.address.clone()).await,
        }
        .map_err(device_error)?;

        Ok(TapoSession { handler })
    }
}

#[async_trait]
impl PlugSession for TapoSession {
    async fn read(&self) -> Result<RawReading, DeviceError> {
        let device_info = self
            .handler
            .get_device_info_json()
            .await
            .map_err(device_error)?;
        let current_power = to_json(self.handler.get_current_power().await.map_err(device_error)?)?;
        let energy_usage = to_json(self.handler.get_energy_usage().await.map_err(device_error)?)?;
        let device_usage = to_json(self.handler.get_device_usage().await.map_err(device_error)?)?;

        Ok(RawReading {
            device_info,
            current_power,
            energy_usage,
            device_usage,
        })
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, DeviceError> {
    serde_json::to_value(value).map_err(|e| DeviceError::InvalidResponse(e.to_string()))
}

fn device_error(err: tapo::Error) -> DeviceError {
    let message = err.to_string();
    match err {
        tapo::Error::Tapo(code) if format!("{:?}", code).contains("Credentials") => {
            DeviceError::Authentication(message)
        }
        tapo::Error::Serde(_) => DeviceError::InvalidResponse(message),
        _ => DeviceError::Transport(message),
    }
}
