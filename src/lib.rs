//! Tapo Exporter Library
//!
//! This library provides the components of a smart-plug telemetry exporter:
//!
//! - **config**: Environment-based configuration for the exporter process
//! - **device**: Device descriptors, telemetry snapshots, and the `DeviceClient` trait
//! - **registry**: The configured device list, loaded from the environment
//! - **collector**: Concurrent per-device polling with isolated failures
//! - **metrics**: Gauge state and Prometheus text rendering
//! - **timeseries**: InfluxDB line-protocol points and writes
//! - **scheduler**: The fixed-interval cycle driver
//! - **server**: HTTP exposition of `/metrics`, `/health`, and `/devices`
//! - **session**: The real-device client, caching one session per plug
//! - **simulator**: A simulated `DeviceClient` for running without hardware
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tapo_exporter::collector::Collector;
//! use tapo_exporter::config::Config;
//! use tapo_exporter::metrics::MetricsPublisher;
//! use tapo_exporter::registry::DeviceRegistry;
//! use tapo_exporter::scheduler::Scheduler;
//! use tapo_exporter::session::{SessionClient, TapoConnector};
//! use tapo_exporter::timeseries::{InfluxWriter, TimeSeriesPublisher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let registry = Arc::new(DeviceRegistry::from_env().expect("No devices"));
//!
//!     let metrics = Arc::new(MetricsPublisher::for_registry(&registry));
//!     let writer = InfluxWriter::new(&config.influx).expect("Failed to create writer");
//!     let timeseries = Arc::new(TimeSeriesPublisher::new(Arc::new(writer)));
//!     let collector = Collector::new(Arc::new(SessionClient::new(TapoConnector)), config.fetch_timeout);
//!
//!     let scheduler = Scheduler::new(
//!         registry,
//!         collector,
//!         metrics.clone(),
//!         timeseries,
//!         config.poll_interval,
//!         config.shutdown_grace,
//!     );
//!
//!     let report = scheduler.run_once().await;
//!     println!("{} devices online", report.succeeded);
//!     print!("{}", metrics.render());
//! }
//! ```

// Module declarations
pub mod collector;
pub mod config;
pub mod device;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod simulator;
pub mod timeseries;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root for convenience
pub use collector::{Collector, PollResult, Reading};
pub use config::{Config, ConfigError, InfluxConfig};
pub use device::{
    Credentials, DeviceClient, DeviceDescriptor, DeviceError, DeviceKind, ProtectionFlags,
    SignalInfo, Snapshot,
};
pub use metrics::{MetricSet, MetricsPublisher};
pub use registry::DeviceRegistry;
pub use scheduler::{CycleReport, Scheduler, SchedulerState};
pub use session::{PlugConnector, PlugSession, RawReading, SessionClient, TapoConnector};
pub use simulator::{SimulatedClient, SimulatorConfig};
pub use timeseries::{
    InfluxWriter, Point, PointSink, PublishError, PublishReport, PublishStats,
    TimeSeriesPublisher,
};
