//! Gauge state for the pull-based metrics endpoint.
//!
//! The [`MetricsPublisher`] owns the last-known value of every gauge. Each
//! poll cycle is applied under a single write lock and every read takes a
//! single read lock, so a scrape never sees a device record that mixes two
//! cycles. A failed poll only flips the device's overall status; the physical
//! readings keep their last-known-good values.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::collector::{PollResult, Reading};
use crate::device::DeviceKind;
use crate::registry::DeviceRegistry;

pub const DEVICE_COUNT: &str = "tapo_device_count";
pub const DEVICE_STATUS: &str = "tapo_device_status";
pub const POWER_WATTS: &str = "tapo_power_watts";
pub const VOLTAGE_VOLTS: &str = "tapo_voltage_volts";
pub const CURRENT_AMPS: &str = "tapo_current_amps";
pub const CALCULATED_CURRENT_AMPS: &str = "tapo_calculated_current_amps";
pub const TODAY_ENERGY_WH: &str = "tapo_today_energy_wh";
pub const MONTH_ENERGY_WH: &str = "tapo_month_energy_wh";
pub const POWER_SAVED_WH: &str = "tapo_power_saved_wh";
pub const TODAY_RUNTIME_MINUTES: &str = "tapo_today_runtime_minutes";
pub const MONTH_RUNTIME_MINUTES: &str = "tapo_month_runtime_minutes";
pub const RUNTIME_SECONDS: &str = "tapo_runtime_seconds";
pub const POWER_PROTECTION_STATUS: &str = "tapo_power_protection_status";
pub const OVERCURRENT_STATUS: &str = "tapo_overcurrent_status";
pub const OVERHEAT_STATUS: &str = "tapo_overheat_status";
pub const SIGNAL_STRENGTH: &str = "tapo_signal_strength";
pub const SIGNAL_RSSI: &str = "tapo_signal_rssi";

/// `status_type` label values of `tapo_device_status`.
pub const STATUS_OVERALL: &str = "overall";
pub const STATUS_POWER_PROTECTION: &str = "power_protection";
pub const STATUS_OVERCURRENT: &str = "overcurrent";
pub const STATUS_OVERHEAT: &str = "overheat";

/// Per-device metric families in exposition order, with help text.
const DEVICE_FAMILIES: &[(&str, &str)] = &[
    (DEVICE_STATUS, "Device status (1=normal, 0=abnormal)"),
    (POWER_WATTS, "Current power consumption in watts"),
    (VOLTAGE_VOLTS, "Current voltage in volts"),
    (CURRENT_AMPS, "Reported current in amperes"),
    (
        CALCULATED_CURRENT_AMPS,
        "Calculated current in amperes (power/voltage)",
    ),
    (TODAY_ENERGY_WH, "Energy consumed today in watt-hours"),
    (MONTH_ENERGY_WH, "Energy consumed this month in watt-hours"),
    (POWER_SAVED_WH, "Power saved in watt-hours"),
    (TODAY_RUNTIME_MINUTES, "Runtime today in minutes"),
    (MONTH_RUNTIME_MINUTES, "Runtime this month in minutes"),
    (RUNTIME_SECONDS, "Time since the relay was switched on in seconds"),
    (
        POWER_PROTECTION_STATUS,
        "Power protection tripped (1=tripped, 0=clear)",
    ),
    (OVERCURRENT_STATUS, "Overcurrent protection tripped (1=tripped, 0=clear)"),
    (OVERHEAT_STATUS, "Overheat protection tripped (1=tripped, 0=clear)"),
    (SIGNAL_STRENGTH, "WiFi signal level"),
    (SIGNAL_RSSI, "WiFi signal strength in dBm"),
];

/// One labeled gauge value of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeSample {
    pub name: &'static str,

    /// Only set for `tapo_device_status`
    pub status_type: Option<&'static str>,

    pub value: f64,
}

impl GaugeSample {
    fn plain(name: &'static str, value: f64) -> Self {
        Self {
            name,
            status_type: None,
            value,
        }
    }

    fn status(status_type: &'static str, normal: bool) -> Self {
        Self {
            name: DEVICE_STATUS,
            status_type: Some(status_type),
            value: flag(normal),
        }
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Last-known state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub kind: DeviceKind,

    /// Whether the most recent poll succeeded
    pub online: bool,

    /// Most recent successful reading, kept across failed polls
    pub reading: Option<Reading>,

    pub last_poll: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// All gauge values currently exported for this device.
    pub fn samples(&self) -> Vec<GaugeSample> {
        let mut samples = vec![GaugeSample::status(STATUS_OVERALL, self.online)];

        let Some(reading) = &self.reading else {
            return samples;
        };
        let s = &reading.snapshot;

        samples.extend([
            GaugeSample::status(STATUS_POWER_PROTECTION, !s.protection.power_protection),
            GaugeSample::status(STATUS_OVERCURRENT, !s.protection.overcurrent),
            GaugeSample::status(STATUS_OVERHEAT, !s.protection.overheat),
            GaugeSample::plain(POWER_WATTS, s.power_watts),
            GaugeSample::plain(VOLTAGE_VOLTS, s.voltage_volts),
            GaugeSample::plain(CURRENT_AMPS, s.current_amps),
        ]);

        if let Some(current) = reading.calculated_current_amps {
            samples.push(GaugeSample::plain(CALCULATED_CURRENT_AMPS, current));
        }

        samples.extend([
            GaugeSample::plain(TODAY_ENERGY_WH, s.energy_today_wh as f64),
            GaugeSample::plain(MONTH_ENERGY_WH, s.energy_month_wh as f64),
            GaugeSample::plain(POWER_SAVED_WH, s.power_saved_wh as f64),
            GaugeSample::plain(TODAY_RUNTIME_MINUTES, s.runtime_today_min as f64),
            GaugeSample::plain(MONTH_RUNTIME_MINUTES, s.runtime_month_min as f64),
            GaugeSample::plain(RUNTIME_SECONDS, s.runtime_seconds as f64),
            GaugeSample::plain(POWER_PROTECTION_STATUS, flag(s.protection.power_protection)),
            GaugeSample::plain(OVERCURRENT_STATUS, flag(s.protection.overcurrent)),
            GaugeSample::plain(OVERHEAT_STATUS, flag(s.protection.overheat)),
            GaugeSample::plain(SIGNAL_STRENGTH, s.signal.strength_level as f64),
            GaugeSample::plain(SIGNAL_RSSI, s.signal.rssi as f64),
        ]);

        samples
    }
}

/// Point-in-time copy of all gauge state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    pub device_count: usize,
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl MetricSet {
    /// Value of an unlabeled-by-status gauge for a device.
    pub fn gauge(&self, device: &str, name: &str) -> Option<f64> {
        self.find(device, name, None)
    }

    /// Value of `tapo_device_status{status_type}` for a device.
    pub fn status(&self, device: &str, status_type: &str) -> Option<f64> {
        self.find(device, DEVICE_STATUS, Some(status_type))
    }

    fn find(&self, device: &str, name: &str, status_type: Option<&str>) -> Option<f64> {
        self.devices
            .get(device)?
            .samples()
            .into_iter()
            .find(|s| s.name == name && s.status_type == status_type)
            .map(|s| s.value)
    }

    fn apply_result(&mut self, result: &PollResult) {
        let record = self
            .devices
            .entry(result.device.name.clone())
            .or_insert_with(|| DeviceRecord {
                kind: result.device.kind,
                online: false,
                reading: None,
                last_poll: result.timestamp,
                last_success: None,
            });

        record.kind = result.device.kind;
        record.last_poll = result.timestamp;

        match &result.outcome {
            Ok(reading) => {
                record.online = true;
                record.reading = Some(reading.clone());
                record.last_success = Some(result.timestamp);
            }
            Err(_) => {
                record.online = false;
            }
        }
    }

    /// Render the Prometheus text exposition format (version 0.0.4).
    pub fn render(&self) -> String {
        let mut out = String::new();

        write_header(&mut out, DEVICE_COUNT, "Number of Tapo devices being monitored");
        let _ = writeln!(out, "{} {}", DEVICE_COUNT, self.device_count);

        let samples: Vec<(&str, &DeviceRecord, Vec<GaugeSample>)> = self
            .devices
            .iter()
            .map(|(name, record)| (name.as_str(), record, record.samples()))
            .collect();

        for (family, help) in DEVICE_FAMILIES {
            let mut header_written = false;

            for (device, record, device_samples) in &samples {
                for sample in device_samples.iter().filter(|s| s.name == *family) {
                    if !header_written {
                        write_header(&mut out, family, help);
                        header_written = true;
                    }

                    let _ = write!(
                        out,
                        "{}{{device_name=\"{}\",device_type=\"{}\"",
                        family,
                        escape_label_value(device),
                        record.kind.label()
                    );
                    if let Some(status_type) = sample.status_type {
                        let _ = write!(out, ",status_type=\"{}\"", status_type);
                    }
                    let _ = writeln!(out, "}} {}", sample.value);
                }
            }
        }

        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Process-wide gauge state, shared between the cycle driver and the
/// exposition server.
#[derive(Debug)]
pub struct MetricsPublisher {
    state: RwLock<MetricSet>,
}

impl MetricsPublisher {
    /// Create a publisher for a fleet of `device_count` configured devices.
    pub fn new(device_count: usize) -> Self {
        Self {
            state: RwLock::new(MetricSet {
                device_count,
                devices: BTreeMap::new(),
            }),
        }
    }

    pub fn for_registry(registry: &DeviceRegistry) -> Self {
        Self::new(registry.len())
    }

    /// Apply one cycle's results.
    ///
    /// Applying the same results again leaves the state unchanged.
    pub fn apply(&self, results: &[PollResult]) {
        // A poisoned lock still holds whole records; keep serving them.
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for result in results {
            state.apply_result(result);
        }

        debug!(
            results = results.len(),
            online = results.iter().filter(|r| r.is_ok()).count(),
            "Applied poll results to gauges"
        );
    }

    /// Consistent copy of the current gauge state.
    pub fn snapshot(&self) -> MetricSet {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Render the current state for a scrape.
    pub fn render(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .render()
    }

    pub fn device_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .device_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::testing::{descriptor, snapshot};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ok_result(name: &str, power: f64, voltage: f64) -> PollResult {
        PollResult {
            device: descriptor(name),
            timestamp: Utc::now(),
            outcome: Ok(Reading::from_snapshot(snapshot(power, voltage))),
        }
    }

    fn err_result(name: &str) -> PollResult {
        PollResult {
            device: descriptor(name),
            timestamp: Utc::now(),
            outcome: Err(DeviceError::Timeout(Duration::from_secs(10))),
        }
    }

    #[test]
    fn test_apply_ok_sets_all_gauges() {
        let publisher = MetricsPublisher::new(1);
        publisher.apply(&[ok_result("plug", 60.0, 230.0)]);

        let set = publisher.snapshot();
        assert_eq!(set.status("plug", STATUS_OVERALL), Some(1.0));
        assert_eq!(set.status("plug", STATUS_OVERHEAT), Some(1.0));
        assert_eq!(set.gauge("plug", POWER_WATTS), Some(60.0));
        assert_eq!(set.gauge("plug", VOLTAGE_VOLTS), Some(230.0));
        assert_eq!(set.gauge("plug", TODAY_ENERGY_WH), Some(1200.0));
        assert_eq!(set.gauge("plug", RUNTIME_SECONDS), Some(18000.0));
        assert_eq!(set.gauge("plug", SIGNAL_RSSI), Some(-45.0));
        assert_eq!(set.gauge("plug", OVERHEAT_STATUS), Some(0.0));

        let current = set.gauge("plug", CALCULATED_CURRENT_AMPS).unwrap();
        assert!((current - 60.0 / 230.0).abs() < 1e-9);
    }

    #[test]
    fn test_tripped_protection() {
        let mut result = ok_result("plug", 60.0, 230.0);
        if let Ok(reading) = &mut result.outcome {
            reading.snapshot.protection.overcurrent = true;
        }

        let publisher = MetricsPublisher::new(1);
        publisher.apply(&[result]);

        let set = publisher.snapshot();
        assert_eq!(set.status("plug", STATUS_OVERCURRENT), Some(0.0));
        assert_eq!(set.status("plug", STATUS_POWER_PROTECTION), Some(1.0));
        assert_eq!(set.gauge("plug", OVERCURRENT_STATUS), Some(1.0));
        // Overall status tracks reachability only
        assert_eq!(set.status("plug", STATUS_OVERALL), Some(1.0));
    }

    #[test]
    fn test_zero_voltage_omits_calculated_current() {
        let publisher = MetricsPublisher::new(1);
        publisher.apply(&[ok_result("plug", 60.0, 230.0)]);
        publisher.apply(&[ok_result("plug", 60.0, 0.0)]);

        let set = publisher.snapshot();
        assert_eq!(set.gauge("plug", CALCULATED_CURRENT_AMPS), None);
        assert!(!publisher.render().contains(CALCULATED_CURRENT_AMPS));
    }

    #[test]
    fn test_failure_keeps_last_known_values() {
        let publisher = MetricsPublisher::new(1);
        publisher.apply(&[ok_result("plug", 60.0, 230.0)]);
        let before = publisher.snapshot();

        publisher.apply(&[err_result("plug")]);
        let after = publisher.snapshot();

        assert_eq!(after.status("plug", STATUS_OVERALL), Some(0.0));
        for (family, _) in DEVICE_FAMILIES.iter().filter(|(f, _)| *f != DEVICE_STATUS) {
            assert_eq!(
                before.gauge("plug", family),
                after.gauge("plug", family),
                "{} changed after a failed poll",
                family
            );
        }
        assert_eq!(after.status("plug", STATUS_OVERHEAT), Some(1.0));
    }

    #[test]
    fn test_failure_before_any_success() {
        let publisher = MetricsPublisher::new(1);
        publisher.apply(&[err_result("plug")]);

        let set = publisher.snapshot();
        assert_eq!(set.status("plug", STATUS_OVERALL), Some(0.0));
        assert_eq!(set.gauge("plug", POWER_WATTS), None);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let results = vec![ok_result("a", 60.0, 230.0), err_result("b")];

        let once = MetricsPublisher::new(2);
        once.apply(&results);

        let twice = MetricsPublisher::new(2);
        twice.apply(&results);
        twice.apply(&results);

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(once.render(), twice.render());
    }

    #[test]
    fn test_device_count_independent_of_poll_success() {
        let publisher = MetricsPublisher::new(3);
        publisher.apply(&[ok_result("a", 1.0, 230.0), err_result("b"), err_result("c")]);
        assert_eq!(publisher.device_count(), 3);

        publisher.apply(&[err_result("a"), err_result("b"), err_result("c")]);
        assert_eq!(publisher.device_count(), 3);
        assert!(publisher.render().contains("tapo_device_count 3\n"));
    }

    #[test]
    fn test_render_format() {
        let publisher = MetricsPublisher::new(2);
        publisher.apply(&[ok_result("desk", 60.0, 230.0), err_result("garage")]);

        let text = publisher.render();

        assert!(text.starts_with("# HELP tapo_device_count"));
        assert!(text.contains("# TYPE tapo_power_watts gauge\n"));
        assert!(text.contains(
            "tapo_device_status{device_name=\"desk\",device_type=\"p110\",status_type=\"overall\"} 1\n"
        ));
        assert!(text.contains(
            "tapo_device_status{device_name=\"garage\",device_type=\"p110\",status_type=\"overall\"} 0\n"
        ));
        assert!(text.contains("tapo_power_watts{device_name=\"desk\",device_type=\"p110\"} 60\n"));
        assert!(!text.contains("tapo_power_watts{device_name=\"garage\""));

        // One header per family
        assert_eq!(text.matches("# TYPE tapo_device_status gauge").count(), 1);
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label_value(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape_label_value("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn test_concurrent_reads_see_whole_cycles() {
        let publisher = Arc::new(MetricsPublisher::new(2));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let set = publisher.snapshot();
                        for record in set.devices.values() {
                            if let Some(reading) = &record.reading {
                                let s = &reading.snapshot;
                                // Every cycle writes voltage = power + 100
                                assert_eq!(s.voltage_volts - s.power_watts, 100.0);
                            }
                        }
                    }
                })
            })
            .collect();

        for cycle in 0..2000 {
            let power = cycle as f64;
            publisher.apply(&[
                ok_result("a", power, power + 100.0),
                ok_result("b", power, power + 100.0),
            ]);
        }

        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().expect("Reader observed a torn record");
        }
    }
}
