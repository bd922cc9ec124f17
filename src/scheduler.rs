//! Poll-cycle scheduler.
//!
//! The scheduler is the single driver of the exporter: on a fixed interval it
//! runs one collector cycle and hands the results to both publishers. At most
//! one cycle is ever in flight; a cycle that overruns the interval is followed
//! immediately by the next one, without a backlog of missed ticks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::{Collector, PollResult};
use crate::metrics::MetricsPublisher;
use crate::registry::DeviceRegistry;
use crate::timeseries::{PublishReport, TimeSeriesPublisher};

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Summary of one completed cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub succeeded: usize,
    pub failed: usize,
    pub publish: PublishReport,
    pub elapsed: Duration,
}

enum CycleExit {
    Completed,

    /// Shutdown arrived mid-cycle and the cycle still finished in time
    CompletedThenStop,

    /// Shutdown arrived before the next cycle, or the in-flight cycle was dropped
    Stop,
}

/// Drives poll cycles until shutdown.
pub struct Scheduler {
    registry: Arc<DeviceRegistry>,
    collector: Collector,
    metrics: Arc<MetricsPublisher>,
    timeseries: Arc<TimeSeriesPublisher>,
    interval: Duration,
    shutdown_grace: Duration,
    state: SchedulerState,
    cycles_completed: u64,
}

impl Scheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        collector: Collector,
        metrics: Arc<MetricsPublisher>,
        timeseries: Arc<TimeSeriesPublisher>,
        interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            registry,
            collector,
            metrics,
            timeseries,
            interval,
            shutdown_grace,
            state: SchedulerState::Idle,
            cycles_completed: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Run a single cycle: poll every device, then publish to both sinks.
    pub async fn run_once(&self) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);

        async {
            let started = Instant::now();
            let results = self.collector.run_cycle(self.registry.devices()).await;
            self.publish(cycle_id, started, results, None).await
        }
        .instrument(span)
        .await
    }

    /// Run cycles on the configured interval until `shutdown` changes.
    ///
    /// A change on the channel, or the sender being dropped, requests
    /// shutdown. A cycle in flight at that moment gets the shutdown grace
    /// period to finish; if it does it is published, otherwise its fetches
    /// are cancelled and nothing from it is published.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.state = SchedulerState::Running;
        info!(
            devices = self.registry.len(),
            interval_ms = self.interval.as_millis() as u64,
            fetch_timeout_ms = self.collector.fetch_timeout().as_millis() as u64,
            "Scheduler started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.next_cycle(&mut ticker, &mut shutdown).await {
                CycleExit::Completed => self.cycles_completed += 1,
                CycleExit::CompletedThenStop => {
                    self.cycles_completed += 1;
                    break;
                }
                CycleExit::Stop => break,
            }
        }

        self.state = SchedulerState::Stopped;
        info!(cycles = self.cycles_completed, "Scheduler stopped");
    }

    async fn next_cycle(
        &self,
        ticker: &mut tokio::time::Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CycleExit {
        if *shutdown.borrow() {
            return CycleExit::Stop;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => return CycleExit::Stop,
            _ = ticker.tick() => {}
        }

        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        let started = Instant::now();

        let collect = self
            .collector
            .run_cycle(self.registry.devices())
            .instrument(span.clone());
        tokio::pin!(collect);

        let (results, shutdown_at) = tokio::select! {
            results = &mut collect => (results, None),
            _ = shutdown.changed() => {
                let shutdown_at = Instant::now();
                info!(
                    cycle_id = %cycle_id,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Shutdown requested, waiting for in-flight cycle"
                );
                match timeout(self.shutdown_grace, &mut collect).await {
                    Ok(results) => (results, Some(shutdown_at)),
                    Err(_) => {
                        warn!(
                            cycle_id = %cycle_id,
                            "In-flight cycle did not finish within grace period, dropping it"
                        );
                        return CycleExit::Stop;
                    }
                }
            }
        };

        // After shutdown, writes only get what is left of the grace period
        let write_limit =
            shutdown_at.map(|at| self.shutdown_grace.saturating_sub(at.elapsed()));
        self.publish(cycle_id, started, results, write_limit)
            .instrument(span)
            .await;

        if shutdown_at.is_some() {
            CycleExit::CompletedThenStop
        } else {
            CycleExit::Completed
        }
    }

    async fn publish(
        &self,
        cycle_id: Uuid,
        started: Instant,
        results: Vec<PollResult>,
        write_limit: Option<Duration>,
    ) -> CycleReport {
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - succeeded;

        self.metrics.apply(&results);
        let publish = match write_limit {
            None => self.timeseries.publish(&results).await,
            Some(limit) => match timeout(limit, self.timeseries.publish(&results)).await {
                Ok(report) => report,
                Err(_) => {
                    warn!(
                        limit_ms = limit.as_millis() as u64,
                        "Time-series writes did not finish within grace period, abandoning them"
                    );
                    PublishReport::default()
                }
            },
        };

        let elapsed = started.elapsed();
        if elapsed > self.interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Cycle overran poll interval"
            );
        }

        info!(
            succeeded,
            failed,
            written = publish.written,
            write_failures = publish.failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Cycle complete"
        );

        CycleReport {
            cycle_id,
            succeeded,
            failed,
            publish,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::metrics::{POWER_WATTS, STATUS_OVERALL};
    use crate::testing::{descriptor, snapshot, Behavior, RecordingSink, ScriptedClient};
    use crate::timeseries::FieldValue;

    struct Harness {
        client: Arc<ScriptedClient>,
        sink: Arc<RecordingSink>,
        metrics: Arc<MetricsPublisher>,
        scheduler: Scheduler,
    }

    fn harness(
        devices: &[&str],
        fetch_timeout: Duration,
        interval: Duration,
        grace: Duration,
    ) -> Harness {
        let registry = Arc::new(
            DeviceRegistry::new(devices.iter().map(|d| descriptor(d)).collect()).unwrap(),
        );
        let client = Arc::new(ScriptedClient::new());
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(MetricsPublisher::for_registry(&registry));
        let timeseries = Arc::new(TimeSeriesPublisher::new(sink.clone()));

        let scheduler = Scheduler::new(
            registry,
            Collector::new(client.clone(), fetch_timeout),
            metrics.clone(),
            timeseries,
            interval,
            grace,
        );

        Harness {
            client,
            sink,
            metrics,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_one_device_times_out() {
        let h = harness(
            &["desk", "garage"],
            Duration::from_millis(100),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        h.client.set("desk", Behavior::Respond(snapshot(60.0, 230.0)));
        h.client.set("garage", Behavior::Hang);

        let report = h.scheduler.run_once().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.publish.written, 1);

        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.status("desk", STATUS_OVERALL), Some(1.0));
        assert_eq!(metrics.status("garage", STATUS_OVERALL), Some(0.0));
        assert_eq!(metrics.gauge("desk", POWER_WATTS), Some(60.0));

        let points = h.sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tag_value("device_name"), Some("desk"));
        assert_eq!(
            points[0].field_value("power_watts"),
            Some(FieldValue::Float(60.0))
        );
    }

    #[tokio::test]
    async fn test_write_failure_does_not_touch_metrics() {
        let registry = Arc::new(DeviceRegistry::new(vec![descriptor("desk")]).unwrap());
        let client = Arc::new(ScriptedClient::new());
        client.set("desk", Behavior::Respond(snapshot(42.0, 230.0)));
        let metrics = Arc::new(MetricsPublisher::for_registry(&registry));
        let sink = Arc::new(RecordingSink::rejecting(&["desk"]));

        let scheduler = Scheduler::new(
            registry,
            Collector::new(client, Duration::from_secs(1)),
            metrics.clone(),
            Arc::new(TimeSeriesPublisher::new(sink)),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );

        let report = scheduler.run_once().await;
        assert_eq!(report.publish.failures.len(), 1);
        assert_eq!(metrics.snapshot().gauge("desk", POWER_WATTS), Some(42.0));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut h = harness(
            &["desk"],
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        h.client.set("desk", Behavior::Respond(snapshot(10.0, 230.0)));
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(180)).await;
            tx.send(true).unwrap();
            tx
        });

        h.scheduler.run(rx).await;
        let _tx = stopper.await.unwrap();

        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        let cycles = h.scheduler.cycles_completed();
        assert!(cycles >= 2, "expected several cycles, got {}", cycles);

        // No cycle starts after shutdown
        let calls = h.client.calls();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.client.calls(), calls);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_scheduler() {
        let mut h = harness(
            &["desk"],
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        h.client.set("desk", Behavior::Respond(snapshot(10.0, 230.0)));

        let (tx, rx) = watch::channel(false);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), h.scheduler.run(rx))
            .await
            .expect("Scheduler should stop when the sender is gone");
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_in_flight_cycle_finishes_within_grace() {
        let mut h = harness(
            &["desk"],
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        h.client.set(
            "desk",
            Behavior::Delay(Duration::from_millis(200), snapshot(75.0, 230.0)),
        );

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            // Keep the sender alive past the end of the cycle
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        h.scheduler.run(rx).await;

        assert_eq!(h.scheduler.cycles_completed(), 1);
        assert_eq!(h.metrics.snapshot().gauge("desk", POWER_WATTS), Some(75.0));
        assert_eq!(h.sink.points().len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_cycle_dropped_after_grace() {
        let mut h = harness(
            &["desk", "garage"],
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_millis(100),
        );
        h.client.set("desk", Behavior::Respond(snapshot(75.0, 230.0)));
        h.client.set("garage", Behavior::Hang);

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let started = Instant::now();
        h.scheduler.run(rx).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.scheduler.cycles_completed(), 0);
        // Partial cycles are never published
        assert!(h.metrics.snapshot().devices.is_empty());
        assert!(h.sink.points().is_empty());
    }

    #[tokio::test]
    async fn test_overrunning_cycles_do_not_overlap() {
        let mut h = harness(
            &["desk"],
            Duration::from_secs(2),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        h.client.set(
            "desk",
            Behavior::Delay(Duration::from_millis(200), snapshot(5.0, 230.0)),
        );

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        h.scheduler.run(rx).await;

        // Sequential 200ms cycles fit at most three starts into 500ms
        let calls = h.client.calls();
        assert!((2..=3).contains(&calls), "unexpected fetch count {}", calls);
        assert_eq!(h.scheduler.cycles_completed() as usize, calls);
    }

    #[tokio::test]
    async fn test_all_devices_failing_keeps_running() {
        let h = harness(
            &["a", "b"],
            Duration::from_millis(50),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        h.client.set(
            "a",
            Behavior::Fail(DeviceError::Transport("unreachable".to_string())),
        );

        for _ in 0..3 {
            let report = h.scheduler.run_once().await;
            assert_eq!(report.failed, 2);
            assert_eq!(report.publish.written, 0);
        }
        assert_eq!(h.metrics.snapshot().status("a", STATUS_OVERALL), Some(0.0));
    }

    #[tokio::test]
    async fn test_writes_after_shutdown_bounded_by_grace() {
        let registry = Arc::new(DeviceRegistry::new(vec![descriptor("desk")]).unwrap());
        let client = Arc::new(ScriptedClient::new());
        client.set(
            "desk",
            Behavior::Delay(Duration::from_millis(100), snapshot(30.0, 230.0)),
        );
        let metrics = Arc::new(MetricsPublisher::for_registry(&registry));
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_secs(5)));

        let mut scheduler = Scheduler::new(
            registry,
            Collector::new(client, Duration::from_secs(2)),
            metrics.clone(),
            Arc::new(TimeSeriesPublisher::new(sink.clone())),
            Duration::from_secs(10),
            Duration::from_millis(300),
        );

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let started = Instant::now();
        scheduler.run(rx).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.cycles_completed(), 1);
        // Gauges are applied even though the write was abandoned
        assert_eq!(metrics.snapshot().gauge("desk", POWER_WATTS), Some(30.0));
        assert!(sink.points().is_empty());
    }
}
