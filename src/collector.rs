//! Poll-cycle collector.
//!
//! One cycle fetches every configured device concurrently, each under its own
//! timeout, and turns whatever happened into one [`PollResult`] per device.
//! A device that fails, hangs, or panics only ever affects its own result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::device::{DeviceClient, DeviceDescriptor, DeviceError, Snapshot};

/// A validated snapshot together with the values derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub snapshot: Snapshot,

    /// `power / voltage`, absent when the device reports zero voltage
    pub calculated_current_amps: Option<f64>,
}

impl Reading {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let calculated_current_amps = snapshot.calculated_current_amps();
        Self {
            snapshot,
            calculated_current_amps,
        }
    }
}

/// Outcome of polling one device in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub device: DeviceDescriptor,

    /// Start of the cycle that produced this result
    pub timestamp: DateTime<Utc>,

    pub outcome: Result<Reading, DeviceError>,
}

impl PollResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn reading(&self) -> Option<&Reading> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&DeviceError> {
        self.outcome.as_ref().err()
    }
}

/// Runs poll cycles against a `DeviceClient`.
pub struct Collector {
    client: Arc<dyn DeviceClient>,
    fetch_timeout: Duration,
}

impl Collector {
    pub fn new(client: Arc<dyn DeviceClient>, fetch_timeout: Duration) -> Self {
        Self {
            client,
            fetch_timeout,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Poll every device once.
    ///
    /// Returns one result per descriptor, in descriptor order, once every
    /// fetch has settled. Dropping the returned future aborts all fetches
    /// still in flight.
    pub async fn run_cycle(&self, descriptors: &[DeviceDescriptor]) -> Vec<PollResult> {
        let timestamp = Utc::now();
        let mut tasks = JoinSet::new();

        for (index, device) in descriptors.iter().cloned().enumerate() {
            let client = Arc::clone(&self.client);
            let fetch_timeout = self.fetch_timeout;

            tasks.spawn(async move {
                let outcome = fetch_one(client.as_ref(), &device, fetch_timeout).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Reading, DeviceError>>> =
            vec![None; descriptors.len()];

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                // The slot stays empty and is reported below
                Err(e) => warn!(error = %e, "Device fetch task did not complete"),
            }
        }

        descriptors
            .iter()
            .zip(outcomes)
            .map(|(device, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err(DeviceError::Aborted("fetch task panicked".to_string()))
                });

                match &outcome {
                    Ok(reading) => debug!(
                        device = %device.name,
                        power_watts = reading.snapshot.power_watts,
                        voltage_volts = reading.snapshot.voltage_volts,
                        calculated_current_amps = ?reading.calculated_current_amps,
                        "Device polled"
                    ),
                    Err(e) => warn!(
                        device = %device.name,
                        address = %device.address,
                        error = %e,
                        "Device fetch failed"
                    ),
                }

                PollResult {
                    device: device.clone(),
                    timestamp,
                    outcome,
                }
            })
            .collect()
    }
}

/// Fetch and normalize a single device under a timeout.
async fn fetch_one(
    client: &dyn DeviceClient,
    device: &DeviceDescriptor,
    limit: Duration,
) -> Result<Reading, DeviceError> {
    let snapshot = match timeout(limit, client.fetch(device)).await {
        Ok(result) => result?,
        Err(_) => return Err(DeviceError::Timeout(limit)),
    };

    snapshot.validate()?;
    Ok(Reading::from_snapshot(snapshot))
}
