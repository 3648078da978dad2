//! Spawns one worker per device, waits for all of them, and reports.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::activity::{Activity, AsyncActivity, Sleep, TokioSleep};
use crate::async_bus::AsyncBus;
use crate::bus::{Bus, DeviceId};
use crate::config::{Runtime, SimulationConfig, ValidConfig};
use crate::device::{Device, WorkerReport};
use crate::error::{ConfigError, SimulationError, WorkerError};
use crate::shutdown::Shutdown;

/// How often the task back-end checks for a stop request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// One entry per device, ordered by device id.
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
}

pub struct Simulation {
    config: ValidConfig,
    shutdown: Shutdown,
}

impl Simulation {
    /// Validates `config`. Nothing is spawned until [`Simulation::run`].
    pub fn new(config: &SimulationConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config: config.validate()?,
            shutdown: Shutdown::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs on the configured back-end with sleeping activities.
    pub fn run(&self) -> Result<SimulationReport, SimulationError> {
        match self.config.runtime() {
            Runtime::Threads => self.run_threads(Arc::new(Sleep)),
            Runtime::Tokio => self.run_tokio(Arc::new(TokioSleep)),
        }
    }

    /// One named OS thread per device, all contending for a [`Bus`].
    pub fn run_threads(
        &self,
        activity: Arc<dyn Activity>,
    ) -> Result<SimulationReport, SimulationError> {
        let started = Instant::now();
        self.announce();

        let bus = Arc::new(Bus::new());
        let mut handles = Vec::with_capacity(self.config.devices());
        for id in (1..=self.config.devices()).map(DeviceId::new) {
            let device = Device::new(id, &self.config);
            let bus0 = bus.clone();
            let activity0 = activity.clone();
            let shutdown0 = self.shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("device-{}", id))
                .spawn(move || device.run(&bus0, activity0.as_ref(), &shutdown0));

            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    error!(device = %id, "failed to spawn device thread: {}", e);
                    self.shutdown.request();
                    for (id, handle) in handles {
                        if let Err(e) = settle(id, handle.join()) {
                            error!(device = %id, "{}", chain(&e));
                        }
                    }
                    return Err(SimulationError::Runtime(e));
                }
            }
        }

        let results = handles
            .into_iter()
            .map(|(id, handle)| settle(id, handle.join()))
            .collect();

        self.finish(results, started)
    }

    /// One tokio task per device on a fresh multi-threaded runtime.
    pub fn run_tokio(
        &self,
        activity: Arc<dyn AsyncActivity>,
    ) -> Result<SimulationReport, SimulationError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("bus-sim-worker")
            .build()?;

        runtime.block_on(self.run_tasks(activity))
    }

    /// Task-based simulation on the caller's tokio runtime.
    pub async fn run_tasks(
        &self,
        activity: Arc<dyn AsyncActivity>,
    ) -> Result<SimulationReport, SimulationError> {
        let started = Instant::now();
        self.announce();

        let bus = Arc::new(AsyncBus::new());
        let closer = {
            let bus0 = bus.clone();
            let shutdown0 = self.shutdown.clone();
            tokio::spawn(async move {
                while !shutdown0.requested() {
                    tokio::time::sleep(SHUTDOWN_POLL).await;
                }
                info!("stop requested, closing bus");
                bus0.close();
            })
        };

        let (ids, tasks): (Vec<_>, Vec<_>) = (1..=self.config.devices())
            .map(DeviceId::new)
            .map(|id| {
                let device = Device::new(id, &self.config);
                let bus0 = bus.clone();
                let activity0 = activity.clone();
                let shutdown0 = self.shutdown.clone();

                let task = tokio::spawn(async move {
                    device
                        .run_async(&bus0, activity0.as_ref(), &shutdown0)
                        .await
                });
                (id, task)
            })
            .unzip();

        let results = ids
            .into_iter()
            .zip(futures::future::join_all(tasks).await)
            .map(|(id, joined)| {
                joined.unwrap_or_else(|_| Err(WorkerError::Panicked { device: id }))
            })
            .collect();
        closer.abort();

        self.finish(results, started)
    }

    fn announce(&self) {
        info!(
            devices = self.config.devices(),
            attempts = self.config.attempts(),
            tmin = self.config.hold().min().as_secs_f64(),
            tmax = self.config.hold().max().as_secs_f64(),
            runtime = ?self.config.runtime(),
            "starting simulation"
        );
    }

    fn finish(
        &self,
        results: Vec<Result<WorkerReport, WorkerError>>,
        started: Instant,
    ) -> Result<SimulationReport, SimulationError> {
        let mut workers = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(report) => workers.push(report),
                Err(e) => {
                    error!(device = %e.device(), "{}", chain(&e));
                    failures.push(e);
                }
            }
        }

        if !failures.is_empty() {
            return Err(SimulationError::Workers(failures));
        }
        if workers.iter().any(|w| w.interrupted) {
            warn!("simulation interrupted");
            return Err(SimulationError::Interrupted);
        }

        workers.sort_by_key(|w| w.device);
        Ok(SimulationReport {
            workers,
            elapsed: started.elapsed(),
        })
    }
}

/// Outcome of a joined device thread; a panic counts as a failure.
fn settle(
    id: DeviceId,
    joined: thread::Result<Result<WorkerReport, WorkerError>>,
) -> Result<WorkerReport, WorkerError> {
    joined.unwrap_or_else(|_| Err(WorkerError::Panicked { device: id }))
}

/// Error message followed by each of its causes.
fn chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut cause = e.source();
    while let Some(c) = cause {
        out.push_str(": ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

/// Runs a simulation with sleeping activities and no external shutdown.
pub fn run(config: &SimulationConfig) -> Result<SimulationReport, SimulationError> {
    Simulation::new(config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::activity::Attempt;
    use crate::error::BusError;

    fn fast(devices: usize, attempts: u32) -> SimulationConfig {
        SimulationConfig {
            devices,
            attempts,
            tmin: 0.001,
            tmax: 0.003,
            think_min: 0.0,
            think_max: 0.002,
            seed: Some(11),
            ..Default::default()
        }
    }

    /// Fails the held section of one device on its second attempt.
    struct FlakyDevice {
        victim: DeviceId,
        holds: AtomicUsize,
    }

    impl Activity for FlakyDevice {
        fn think(&self, _: &Attempt) -> anyhow::Result<()> {
            Ok(())
        }

        fn hold(&self, attempt: &Attempt) -> anyhow::Result<()> {
            self.holds.fetch_add(1, Ordering::SeqCst);
            if attempt.device == self.victim && attempt.number == 2 {
                anyhow::bail!("bus parity error");
            }
            Ok(())
        }
    }

    #[test]
    fn invalid_config_spawns_nothing() {
        let config = SimulationConfig {
            tmin: 2.0,
            tmax: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            run(&config),
            Err(SimulationError::Config(ConfigError::InvertedRange { .. }))
        ));
    }

    #[test]
    fn reports_every_device_in_order() {
        let report = run(&fast(4, 2)).unwrap();
        let ids: Vec<_> = report.workers.iter().map(|w| w.device.get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(report.workers.iter().all(|w| w.completed == 2));
    }

    #[test]
    fn failed_worker_is_surfaced_after_everyone_joins() {
        let simulation = Simulation::new(&fast(3, 3)).unwrap();
        let activity = Arc::new(FlakyDevice {
            victim: DeviceId::new(2),
            holds: AtomicUsize::new(0),
        });

        let err = simulation.run_threads(activity.clone()).unwrap_err();
        match err {
            SimulationError::Workers(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].device(), DeviceId::new(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Devices 1 and 3 ran all three attempts, device 2 stopped at its second.
        assert_eq!(activity.holds.load(Ordering::SeqCst), 3 + 3 + 2);
    }

    #[test]
    fn panicking_worker_is_surfaced() {
        struct Explodes;
        impl Activity for Explodes {
            fn think(&self, attempt: &Attempt) -> anyhow::Result<()> {
                if attempt.device == DeviceId::new(1) {
                    panic!("device 1 exploded");
                }
                Ok(())
            }

            fn hold(&self, _: &Attempt) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let simulation = Simulation::new(&fast(2, 1)).unwrap();
        let err = simulation.run_threads(Arc::new(Explodes)).unwrap_err();
        match err {
            SimulationError::Workers(failures) => {
                assert!(matches!(
                    failures.as_slice(),
                    [WorkerError::Panicked { device }] if *device == DeviceId::new(1)
                ));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn requested_shutdown_reports_interrupted() {
        let shutdown = Shutdown::new();
        shutdown.request();
        let simulation = Simulation::new(&fast(2, 3))
            .unwrap()
            .with_shutdown(shutdown);

        assert!(matches!(
            simulation.run(),
            Err(SimulationError::Interrupted)
        ));
    }

    #[test]
    fn tokio_runtime_completes() {
        let config = SimulationConfig {
            runtime: Runtime::Tokio,
            ..fast(3, 2)
        };
        let report = run(&config).unwrap();
        assert_eq!(report.workers.len(), 3);
        assert!(report.workers.iter().all(|w| w.completed == 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tasks_release_after_failed_hold() {
        struct FailsOnce {
            failed: Mutex<bool>,
        }
        impl AsyncActivity for FailsOnce {
            fn hold<'a>(
                &'a self,
                _: &'a Attempt,
            ) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
                use futures::FutureExt;
                let mut failed = self.failed.lock().unwrap();
                let outcome = if *failed {
                    Ok(())
                } else {
                    *failed = true;
                    Err(anyhow::anyhow!("checksum mismatch"))
                };
                futures::future::ready(outcome).boxed()
            }
        }

        let simulation = Simulation::new(&fast(3, 2)).unwrap();
        let err = simulation
            .run_tasks(Arc::new(FailsOnce {
                failed: Mutex::new(false),
            }))
            .await
            .unwrap_err();

        // Only the device whose hold failed is reported.
        assert!(matches!(err, SimulationError::Workers(ref f) if f.len() == 1));
    }

    #[test]
    fn chain_includes_causes() {
        let err = WorkerError::Bus {
            device: DeviceId::new(1),
            attempt: 2,
            source: BusError::Closed {
                device: DeviceId::new(1),
            },
        };
        assert_eq!(
            chain(&err),
            "device 1 hit a bus error during attempt 2: device 1 cannot acquire a closed bus"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_request_closes_bus_for_waiting_tasks() {
        /// First holder asks to stop, then keeps the bus well past the poll.
        struct StopWhileHolding {
            shutdown: Shutdown,
            holds: AtomicUsize,
        }
        impl AsyncActivity for StopWhileHolding {
            fn think<'a>(
                &'a self,
                _: &'a Attempt,
            ) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
                use futures::FutureExt;
                futures::future::ready(Ok(())).boxed()
            }

            fn hold<'a>(
                &'a self,
                _: &'a Attempt,
            ) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
                use futures::FutureExt;
                self.holds.fetch_add(1, Ordering::SeqCst);
                self.shutdown.request();
                tokio::time::sleep(Duration::from_millis(200)).map(Ok).boxed()
            }
        }

        let shutdown = Shutdown::new();
        let activity = Arc::new(StopWhileHolding {
            shutdown: shutdown.clone(),
            holds: AtomicUsize::new(0),
        });
        let simulation = Simulation::new(&fast(4, 3))
            .unwrap()
            .with_shutdown(shutdown);

        let result = simulation.run_tasks(activity.clone()).await;

        assert!(matches!(result, Err(SimulationError::Interrupted)));
        // Devices queued behind the first holder never got the bus.
        assert_eq!(activity.holds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settle_counts_panic_as_failure() {
        let panicked: thread::Result<Result<WorkerReport, WorkerError>> =
            Err(Box::new("device exploded"));
        assert!(matches!(
            settle(DeviceId::new(4), panicked),
            Err(WorkerError::Panicked { device }) if device == DeviceId::new(4)
        ));

        let report = WorkerReport {
            device: DeviceId::new(2),
            completed: 3,
            waited: Duration::ZERO,
            held: Duration::from_millis(5),
            interrupted: false,
        };
        assert_eq!(
            settle(DeviceId::new(2), Ok(Ok(report.clone()))).unwrap(),
            report
        );
    }
}
