//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::device::{
    Credentials, DeviceClient, DeviceDescriptor, DeviceError, DeviceKind, ProtectionFlags,
    SignalInfo, Snapshot,
};
use crate::timeseries::{Point, PointSink, PublishError};

/// How a scripted device answers a fetch.
#[derive(Debug, Clone)]
pub enum Behavior {
    Respond(Snapshot),
    Delay(Duration, Snapshot),
    Fail(DeviceError),
    Hang,
    Panic,
}

/// `DeviceClient` whose answers are scripted per device name.
///
/// Devices without a script fail with a transport error.
pub struct ScriptedClient {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, device: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(device.to_string(), behavior);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    async fn fetch(&self, device: &DeviceDescriptor) -> Result<Snapshot, DeviceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behaviors.lock().unwrap().get(&device.name).cloned();

        match behavior {
            Some(Behavior::Respond(snapshot)) => Ok(snapshot),
            Some(Behavior::Delay(delay, snapshot)) => {
                tokio::time::sleep(delay).await;
                Ok(snapshot)
            }
            Some(Behavior::Fail(e)) => Err(e),
            Some(Behavior::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Behavior::Panic) => panic!("scripted panic for {}", device.name),
            None => Err(DeviceError::Transport("connection refused".to_string())),
        }
    }
}

/// `PointSink` that records points and rejects the configured devices.
///
/// Every write first waits for the configured delay.
pub struct RecordingSink {
    points: Mutex<Vec<Point>>,
    reject: Vec<String>,
    delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::rejecting(&[])
    }

    pub fn rejecting(devices: &[&str]) -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            reject: devices.iter().map(|d| d.to_string()).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl PointSink for RecordingSink {
    async fn write(&self, point: &Point) -> Result<(), PublishError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let device = point.tag_value("device_name").unwrap_or_default();
        if self.reject.iter().any(|r| r == device) {
            return Err(PublishError::Status {
                code: StatusCode::SERVICE_UNAVAILABLE,
                message: "bucket unavailable".to_string(),
            });
        }
        self.points.lock().unwrap().push(point.clone());
        Ok(())
    }
}

pub fn descriptor(name: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(
        name,
        DeviceKind::P110,
        "192.168.1.50",
        Credentials::new("user@example.com", "secret"),
    )
}

/// A plausible snapshot with the given power and voltage.
pub fn snapshot(power_watts: f64, voltage_volts: f64) -> Snapshot {
    Snapshot {
        power_watts,
        voltage_volts,
        current_amps: 0.25,
        energy_today_wh: 1200,
        energy_month_wh: 35000,
        power_saved_wh: 40,
        runtime_today_min: 300,
        runtime_month_min: 9000,
        runtime_seconds: 18000,
        protection: ProtectionFlags::default(),
        signal: SignalInfo {
            strength_level: 3,
            rssi: -45,
        },
    }
}
