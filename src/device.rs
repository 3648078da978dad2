//! A device repeatedly thinks, takes the bus, holds it, and gives it back.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::activity::{Activity, AsyncActivity, Attempt};
use crate::async_bus::AsyncBus;
use crate::bus::{Bus, DeviceId};
use crate::config::{DurationRange, ValidConfig};
use crate::error::{BusError, WorkerError};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Created,
    Thinking,
    Waiting,
    Holding,
    Terminated,
}

/// What a device did before it terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub device: DeviceId,
    /// Acquire/release cycles finished.
    pub completed: u32,
    /// Time spent blocked in acquire.
    pub waited: Duration,
    /// Time spent holding the bus.
    pub held: Duration,
    /// Stopped early on a shutdown request.
    pub interrupted: bool,
}

impl WorkerReport {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            completed: 0,
            waited: Duration::ZERO,
            held: Duration::ZERO,
            interrupted: false,
        }
    }
}

pub struct Device {
    id: DeviceId,
    attempts: u32,
    hold: DurationRange,
    think: DurationRange,
    acquire_timeout: Option<Duration>,
    rng: StdRng,
    phase: DevicePhase,
}

impl Device {
    pub fn new(id: DeviceId, config: &ValidConfig) -> Self {
        Self {
            id,
            attempts: config.attempts(),
            hold: config.hold(),
            think: config.think(),
            acquire_timeout: config.acquire_timeout(),
            rng: config.rng_for(id),
            phase: DevicePhase::Created,
        }
    }

    pub fn phase(&self) -> DevicePhase {
        self.phase
    }

    fn enter(&mut self, phase: DevicePhase) {
        debug!(device = %self.id, from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
    }

    fn draw(&mut self, number: u32) -> Attempt {
        Attempt {
            device: self.id,
            number,
            think: self.think.sample(&mut self.rng),
            hold: self.hold.sample(&mut self.rng),
        }
    }

    fn activity_failed(&self, number: u32) -> impl FnOnce(anyhow::Error) -> WorkerError {
        let device = self.id;
        move |source| WorkerError::Activity {
            device,
            attempt: number,
            source,
        }
    }

    fn bus_failed(&self, number: u32) -> impl FnOnce(BusError) -> WorkerError {
        let device = self.id;
        move |source| WorkerError::Bus {
            device,
            attempt: number,
            source,
        }
    }

    /// Runs every attempt on the calling thread.
    ///
    /// The bus is released before this returns, on success and on failure.
    pub fn run(
        mut self,
        bus: &Bus,
        activity: &dyn Activity,
        shutdown: &Shutdown,
    ) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::new(self.id);

        for number in 1..=self.attempts {
            if shutdown.requested() {
                info!(device = %self.id, attempt = number, "stopping early");
                report.interrupted = true;
                break;
            }

            let attempt = self.draw(number);
            self.enter(DevicePhase::Thinking);
            activity
                .think(&attempt)
                .map_err(self.activity_failed(number))?;

            self.enter(DevicePhase::Waiting);
            info!(device = %self.id, attempt = number, "waiting for bus");
            let started = Instant::now();
            let guard = match self.acquire_timeout {
                Some(timeout) => bus
                    .acquire_timeout(self.id, timeout)
                    .map_err(self.bus_failed(number))?,
                None => bus.acquire(self.id),
            };
            report.waited += started.elapsed();

            self.enter(DevicePhase::Holding);
            info!(
                device = %self.id,
                attempt = number,
                hold = ?attempt.hold,
                "using bus"
            );
            let started = Instant::now();
            let outcome = activity.hold(&attempt);
            report.held += started.elapsed();

            info!(device = %self.id, attempt = number, "releasing bus");
            guard.release().map_err(self.bus_failed(number))?;
            outcome.map_err(self.activity_failed(number))?;
            report.completed += 1;
        }

        self.enter(DevicePhase::Terminated);
        info!(device = %self.id, completed = report.completed, "finished");
        Ok(report)
    }

    /// Async twin of [`Device::run`] for the tokio back-end.
    pub async fn run_async(
        mut self,
        bus: &AsyncBus,
        activity: &dyn AsyncActivity,
        shutdown: &Shutdown,
    ) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::new(self.id);

        for number in 1..=self.attempts {
            if shutdown.requested() {
                info!(device = %self.id, attempt = number, "stopping early");
                report.interrupted = true;
                break;
            }

            let attempt = self.draw(number);
            self.enter(DevicePhase::Thinking);
            activity
                .think(&attempt)
                .await
                .map_err(self.activity_failed(number))?;

            self.enter(DevicePhase::Waiting);
            info!(device = %self.id, attempt = number, "waiting for bus");
            let started = Instant::now();
            let acquired = match self.acquire_timeout {
                Some(timeout) => bus.acquire_timeout(self.id, timeout).await,
                None => bus.acquire(self.id).await,
            };
            let guard = match acquired {
                Ok(guard) => guard,
                // The coordinator closes the bus once a stop is requested.
                Err(BusError::Closed { .. }) => {
                    info!(device = %self.id, attempt = number, "bus closed, stopping early");
                    report.interrupted = true;
                    break;
                }
                Err(e) => return Err(self.bus_failed(number)(e)),
            };
            report.waited += started.elapsed();

            self.enter(DevicePhase::Holding);
            info!(
                device = %self.id,
                attempt = number,
                hold = ?attempt.hold,
                "using bus"
            );
            let started = Instant::now();
            let outcome = activity.hold(&attempt).await;
            report.held += started.elapsed();

            info!(device = %self.id, attempt = number, "releasing bus");
            guard.release().map_err(self.bus_failed(number))?;
            outcome.map_err(self.activity_failed(number))?;
            report.completed += 1;
        }

        self.enter(DevicePhase::Terminated);
        info!(device = %self.id, completed = report.completed, "finished");
        Ok(report)
    }
}
