use std::time::Duration;

use thiserror::Error;

use crate::bus::DeviceId;

/// Invalid simulation parameters. Raised before any worker exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("device count must be at least 1")]
    NoDevices,
    #[error("{name} must be a finite number of seconds, got {value}")]
    NotFinite { name: &'static str, value: f64 },
    #[error("{name} must not be negative, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("{name} is too large, got {value}")]
    TooLarge { name: &'static str, value: f64 },
    #[error("{min_name} ({min}) must not exceed {max_name} ({max})")]
    InvertedRange {
        min_name: &'static str,
        min: f64,
        max_name: &'static str,
        max: f64,
    },
    #[error("acquire timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Release without a matching acquire, a double release, or a release
    /// issued by a device that is not the current holder.
    #[error("device {device} released the bus while {}", describe_holder(.holder))]
    Misuse {
        device: DeviceId,
        holder: Option<DeviceId>,
    },
    #[error("device {device} gave up waiting for the bus after {waited:?}")]
    Timeout { device: DeviceId, waited: Duration },
    #[error("device {device} cannot acquire a closed bus")]
    Closed { device: DeviceId },
}

fn describe_holder(holder: &Option<DeviceId>) -> String {
    match holder {
        Some(h) => format!("device {} holds it", h),
        None => "nobody holds it".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("device {device} failed during attempt {attempt}")]
    Activity {
        device: DeviceId,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("device {device} hit a bus error during attempt {attempt}")]
    Bus {
        device: DeviceId,
        attempt: u32,
        #[source]
        source: BusError,
    },
    #[error("device {device} panicked")]
    Panicked { device: DeviceId },
}

impl WorkerError {
    pub fn device(&self) -> DeviceId {
        match self {
            WorkerError::Activity { device, .. }
            | WorkerError::Bus { device, .. }
            | WorkerError::Panicked { device } => *device,
        }
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{} of the devices failed", .0.len())]
    Workers(Vec<WorkerError>),
    #[error("simulation interrupted before all devices finished")]
    Interrupted,
    #[error("failed to start the simulation runtime")]
    Runtime(#[from] std::io::Error),
}
