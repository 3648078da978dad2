use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bus::DeviceId;
use crate::error::ConfigError;

pub const DEFAULT_DEVICES: usize = 5;
pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_TMIN: f64 = 0.5;
pub const DEFAULT_TMAX: f64 = 1.5;

/// Idle interval a device spends before asking for the bus.
pub const THINK_MIN: f64 = 0.1;
pub const THINK_MAX: f64 = 0.6;

/// How devices are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Runtime {
    /// One OS thread per device.
    #[default]
    Threads,
    /// One tokio task per device on a multi-threaded runtime.
    Tokio,
}

/// Simulation parameters as supplied by the caller, durations in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub devices: usize,
    pub attempts: u32,
    pub tmin: f64,
    pub tmax: f64,
    pub think_min: f64,
    pub think_max: f64,
    pub acquire_timeout: Option<f64>,
    pub seed: Option<u64>,
    pub runtime: Runtime,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: DEFAULT_DEVICES,
            attempts: DEFAULT_ATTEMPTS,
            tmin: DEFAULT_TMIN,
            tmax: DEFAULT_TMAX,
            think_min: THINK_MIN,
            think_max: THINK_MAX,
            acquire_timeout: None,
            seed: None,
            runtime: Runtime::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<ValidConfig, ConfigError> {
        if self.devices == 0 {
            return Err(ConfigError::NoDevices);
        }

        let hold = DurationRange::from_secs(("tmin", self.tmin), ("tmax", self.tmax))?;
        let think = DurationRange::from_secs(
            ("think_min", self.think_min),
            ("think_max", self.think_max),
        )?;

        let acquire_timeout = match self.acquire_timeout {
            Some(secs) => {
                let timeout = seconds("acquire_timeout", secs)?;
                if timeout.is_zero() {
                    return Err(ConfigError::ZeroTimeout);
                }
                Some(timeout)
            }
            None => None,
        };

        Ok(ValidConfig {
            devices: self.devices,
            attempts: self.attempts,
            hold,
            think,
            acquire_timeout,
            seed: self.seed,
            runtime: self.runtime,
        })
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::NotFinite { name, value });
    }
    if value < 0.0 {
        return Err(ConfigError::Negative { name, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::TooLarge { name, value })
}

/// Closed interval of durations a device draws from uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationRange {
    min: Duration,
    max: Duration,
}

impl DurationRange {
    pub fn from_secs(
        (min_name, min): (&'static str, f64),
        (max_name, max): (&'static str, f64),
    ) -> Result<Self, ConfigError> {
        let lo = seconds(min_name, min)?;
        let hi = seconds(max_name, max)?;
        if lo > hi {
            return Err(ConfigError::InvertedRange {
                min_name,
                min,
                max_name,
                max,
            });
        }
        Ok(Self { min: lo, max: hi })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let secs = rng.random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs).clamp(self.min, self.max)
    }
}

/// Parameters that passed validation. Only [`SimulationConfig::validate`]
/// builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidConfig {
    devices: usize,
    attempts: u32,
    hold: DurationRange,
    think: DurationRange,
    acquire_timeout: Option<Duration>,
    seed: Option<u64>,
    runtime: Runtime,
}

impl ValidConfig {
    pub fn devices(&self) -> usize {
        self.devices
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn hold(&self) -> DurationRange {
        self.hold
    }

    pub fn think(&self) -> DurationRange {
        self.think
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    /// Random source for one device. Seeded runs give every device its own
    /// reproducible stream.
    pub fn rng_for(&self, device: DeviceId) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(device.get() as u64)),
            None => StdRng::from_os_rng(),
        }
    }
}
