//! Tapo Exporter - Smart-plug telemetry exporter
//!
//! This service polls a fleet of Tapo smart plugs on a fixed interval and
//! publishes every cycle to a Prometheus scrape endpoint and to InfluxDB.
//!
//! ## Features
//!
//! - Concurrent per-device polling with per-device timeouts
//! - Prometheus text exposition on `/metrics`
//! - InfluxDB v2 line-protocol writes
//! - Graceful shutdown on SIGINT/SIGTERM
//!
//! ## Configuration
//!
//! Devices are read from `TAPO_USERNAME`/`TAPO_PASSWORD`/`TAPO_DEVICES`, or
//! from `TAPO_DEVICE_COUNT` and `TAPO_DEVICE_{i}_*`. Process settings:
//!
//! - `TAPO_POLL_INTERVAL_SECS`: Seconds between poll cycles (default: 2)
//! - `TAPO_FETCH_TIMEOUT_SECS`: Per-device fetch timeout (default: 10)
//! - `PROMETHEUS_PORT`: Metrics port (default: 8000)
//! - `INFLUXDB_URL`, `INFLUXDB_TOKEN`, `INFLUXDB_ORG`, `INFLUXDB_BUCKET`
//! - `TAPO_SIMULATE`: Poll simulated plugs instead of real devices (default: false)
//! - `RUST_LOG` or `LOG_LEVEL`: Logging level filter (default: info)

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tapo_exporter::collector::Collector;
use tapo_exporter::config::Config;
use tapo_exporter::metrics::MetricsPublisher;
use tapo_exporter::registry::DeviceRegistry;
use tapo_exporter::scheduler::Scheduler;
use tapo_exporter::device::DeviceClient;
use tapo_exporter::server;
use tapo_exporter::session::{SessionClient, TapoConnector};
use tapo_exporter::simulator::{SimulatedClient, SimulatorConfig};
use tapo_exporter::timeseries::{InfluxWriter, TimeSeriesPublisher};

/// Extra time allowed for tasks to wind down after the cycle grace period
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Tapo exporter...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                poll_interval_secs = config.poll_interval.as_secs(),
                fetch_timeout_secs = config.fetch_timeout.as_secs(),
                metrics_port = config.metrics_port,
                influxdb_url = %config.influx.url,
                bucket = %config.influx.bucket,
                cost_per_kwh = config.cost_per_kwh,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let registry = match DeviceRegistry::from_env() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "Failed to load devices");
            std::process::exit(1);
        }
    };

    // Connections are pooled for the lifetime of the process
    let writer = match InfluxWriter::new(&config.influx) {
        Ok(writer) => {
            info!(write_url = %writer.write_url(), "InfluxDB writer initialized");
            Arc::new(writer)
        }
        Err(e) => {
            error!(error = %e, "Failed to create InfluxDB writer");
            std::process::exit(1);
        }
    };
    if config.influx.token.is_empty() {
        warn!("INFLUXDB_TOKEN is not set, writes will likely be rejected");
    }

    let client: Arc<dyn DeviceClient> = if config.simulate {
        warn!(
            failure_rate = config.simulation_failure_rate,
            "TAPO_SIMULATE is set, polling simulated devices"
        );
        Arc::new(SimulatedClient::new(SimulatorConfig {
            failure_rate: config.simulation_failure_rate,
            ..SimulatorConfig::default()
        }))
    } else {
        info!(devices = registry.len(), "Using Tapo device client");
        Arc::new(SessionClient::new(TapoConnector))
    };

    let metrics = Arc::new(MetricsPublisher::for_registry(&registry));
    let timeseries = Arc::new(TimeSeriesPublisher::new(writer));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn exposition server
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics_port));
    let server_metrics = metrics.clone();
    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(addr, server_metrics, server_shutdown).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    // Spawn scheduler - drives poll cycles until shutdown
    let mut scheduler = Scheduler::new(
        registry,
        Collector::new(client, config.fetch_timeout),
        metrics,
        timeseries.clone(),
        config.poll_interval,
        config.shutdown_grace,
    );
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    info!("Tapo exporter running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = config.shutdown_grace + SHUTDOWN_MARGIN;
    let joined = tokio::time::timeout(shutdown_timeout, async {
        (scheduler_handle.await, server_handle.await)
    })
    .await;

    match joined {
        Ok((Ok(()), Ok(()))) => info!("Tasks shut down gracefully"),
        Ok((scheduler, server)) => {
            if let Err(e) = scheduler {
                warn!(error = %e, "Scheduler task panicked during shutdown");
            }
            if let Err(e) = server {
                warn!(error = %e, "Server task panicked during shutdown");
            }
        }
        Err(_) => warn!("Shutdown timed out after {:?}", shutdown_timeout),
    }

    let stats = timeseries.stats();
    info!(
        points_written = stats.points_written,
        points_failed = stats.points_failed,
        devices_skipped = stats.devices_skipped,
        "Tapo exporter stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// `RUST_LOG` takes precedence; `LOG_LEVEL` is accepted as a plain level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level_directive(std::env::var("LOG_LEVEL").ok())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Map a `LOG_LEVEL` value to a filter directive.
fn log_level_directive(level: Option<String>) -> String {
    match level.as_deref().map(|l| l.trim().to_ascii_lowercase()) {
        Some(l) if l == "warning" => "warn".to_string(),
        Some(l) if l == "critical" => "error".to_string(),
        Some(l) if !l.is_empty() => l,
        _ => "info".to_string(),
    }
}

/// Wait for Ctrl+C, or SIGTERM on unix.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown signal received, stopping..."),
        _ = terminate => info!("SIGTERM received, stopping..."),
    }
}
