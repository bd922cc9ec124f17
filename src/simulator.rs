//! Simulated smart plugs.
//!
//! [`SimulatedClient`] produces realistic telemetry without any hardware:
//! each device settles into a load profile (idle, standby, active, heavy),
//! draws power from that profile's range, and accumulates energy and runtime
//! across polls. A configurable share of fetches fails the way real plugs do.
//! The binary uses it only when `TAPO_SIMULATE` is set.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::trace;

use crate::device::{
    DeviceClient, DeviceDescriptor, DeviceError, DeviceKind, ProtectionFlags, SignalInfo,
    Snapshot,
};

/// What the load behind a plug is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    Idle,
    Standby,
    Active,
    Heavy,
}

impl LoadProfile {
    pub fn all() -> &'static [LoadProfile] {
        &[
            LoadProfile::Idle,
            LoadProfile::Standby,
            LoadProfile::Active,
            LoadProfile::Heavy,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoadProfile::Idle => "idle",
            LoadProfile::Standby => "standby",
            LoadProfile::Active => "active",
            LoadProfile::Heavy => "heavy",
        }
    }

    /// Power draw range in watts.
    pub fn power_range(&self) -> (f64, f64) {
        match self {
            LoadProfile::Idle => (0.0, 0.0),
            LoadProfile::Standby => (0.5, 5.0),
            LoadProfile::Active => (20.0, 300.0),
            LoadProfile::Heavy => (800.0, 2000.0),
        }
    }

    // Idle: 10%, Standby: 30%, Active: 50%, Heavy: 10%
    fn pick(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..100) {
            0..=9 => LoadProfile::Idle,
            10..=39 => LoadProfile::Standby,
            40..=89 => LoadProfile::Active,
            _ => LoadProfile::Heavy,
        }
    }
}

/// Configuration for the simulated client.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability (0.0 - 1.0) that a fetch fails
    pub failure_rate: f64,

    /// Mains voltage the plugs report around
    pub nominal_voltage: f64,

    /// Probability that a heavy load trips overcurrent protection
    pub trip_rate: f64,

    /// Probability that a device switches load profile between polls
    pub profile_change_rate: f64,

    /// Simulated round-trip latency range
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            nominal_voltage: 230.0,
            trip_rate: 0.02,
            profile_change_rate: 0.2,
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(120),
        }
    }
}

/// Accumulated counters for one simulated plug.
#[derive(Debug, Clone)]
struct PlugState {
    profile: LoadProfile,
    energy_today_wh: f64,
    energy_month_wh: f64,
    power_saved_wh: f64,
    runtime_seconds: f64,
    last_fetch: Instant,
}

impl PlugState {
    fn new(rng: &mut impl Rng) -> Self {
        // Start partway through the day and month
        let energy_today_wh = rng.gen_range(0.0..2000.0);
        Self {
            profile: LoadProfile::pick(rng),
            energy_today_wh,
            energy_month_wh: energy_today_wh + rng.gen_range(0.0..40000.0),
            power_saved_wh: 0.0,
            runtime_seconds: rng.gen_range(0.0..36000.0),
            last_fetch: Instant::now(),
        }
    }
}

/// `DeviceClient` that fabricates plausible plug telemetry.
pub struct SimulatedClient {
    config: SimulatorConfig,
    plugs: Mutex<HashMap<String, PlugState>>,
}

impl SimulatedClient {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            plugs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Produce the next outcome for a device and the latency to simulate.
    fn next_outcome(&self, device: &DeviceDescriptor) -> (Duration, Result<Snapshot, DeviceError>) {
        let mut rng = rand::thread_rng();
        let latency = self.latency(&mut rng);

        if rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0)) {
            let error = match rng.gen_range(0..10) {
                0..=5 => DeviceError::Transport("connection reset by peer".to_string()),
                6..=8 => DeviceError::Transport("no route to host".to_string()),
                _ => DeviceError::Authentication("session expired".to_string()),
            };
            return (latency, Err(error));
        }

        let mut plugs = self.plugs.lock().unwrap_or_else(PoisonError::into_inner);
        let state = plugs
            .entry(device.name.clone())
            .or_insert_with(|| PlugState::new(&mut rng));

        if rng.gen_bool(self.config.profile_change_rate.clamp(0.0, 1.0)) {
            state.profile = LoadProfile::pick(&mut rng);
        }

        let snapshot = self.advance(&mut rng, device.kind, state);
        trace!(
            device = %device.name,
            profile = state.profile.name(),
            power_watts = snapshot.power_watts,
            "Simulated reading"
        );

        (latency, Ok(snapshot))
    }

    fn latency(&self, rng: &mut impl Rng) -> Duration {
        let (min, max) = (self.config.min_latency, self.config.max_latency);
        if max <= min {
            return min;
        }
        rng.gen_range(min..=max)
    }

    /// Step a plug's counters forward to now and read it.
    fn advance(&self, rng: &mut impl Rng, kind: DeviceKind, state: &mut PlugState) -> Snapshot {
        let (low, high) = state.profile.power_range();
        let power_watts = if high > low {
            rng.gen_range(low..high)
        } else {
            low
        };

        let nominal = self.config.nominal_voltage;
        let voltage_volts = if nominal > 0.0 {
            rng.gen_range(nominal * 0.98..=nominal * 1.02)
        } else {
            0.0
        };

        // Reported current differs slightly from power / voltage (power factor)
        let current_amps = if voltage_volts > 0.0 {
            power_watts / voltage_volts * rng.gen_range(1.0..1.08)
        } else {
            0.0
        };

        let elapsed = state.last_fetch.elapsed().as_secs_f64();
        state.last_fetch = Instant::now();

        let energy = power_watts * elapsed / 3600.0;
        state.energy_today_wh += energy;
        state.energy_month_wh += energy;
        if power_watts > 0.0 {
            state.runtime_seconds += elapsed;
        }
        // Only the P115 reports savings from scheduled off-time
        if kind == DeviceKind::P115 && state.profile == LoadProfile::Standby {
            state.power_saved_wh += energy * 0.5;
        }

        let overcurrent = state.profile == LoadProfile::Heavy
            && rng.gen_bool(self.config.trip_rate.clamp(0.0, 1.0));

        let runtime_seconds = state.runtime_seconds as u64;
        Snapshot {
            power_watts,
            voltage_volts,
            current_amps,
            energy_today_wh: state.energy_today_wh as u64,
            energy_month_wh: state.energy_month_wh as u64,
            power_saved_wh: state.power_saved_wh as u64,
            runtime_today_min: (runtime_seconds / 60).min(24 * 60),
            runtime_month_min: runtime_seconds / 60,
            runtime_seconds,
            protection: ProtectionFlags {
                overcurrent,
                overheat: false,
                power_protection: overcurrent,
            },
            signal: SignalInfo {
                strength_level: rng.gen_range(1..=3),
                rssi: rng.gen_range(-80..=-35),
            },
        }
    }
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl DeviceClient for SimulatedClient {
    async fn fetch(&self, device: &DeviceDescriptor) -> Result<Snapshot, DeviceError> {
        let (latency, outcome) = self.next_outcome(device);
        tokio::time::sleep(latency).await;
        outcome
    }
}
