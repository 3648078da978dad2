//! Devices contending for a single shared bus.
//!
//! Every device repeatedly thinks, takes the bus, holds it for a random
//! duration and gives it back. The bus admits one holder at a time; a
//! [`bus::BusGuard`] returns it on every exit path.

pub mod activity;
pub mod async_bus;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod shutdown;

pub use activity::{Activity, AsyncActivity, Attempt, Sleep, TokioSleep};
pub use async_bus::{AsyncBus, AsyncBusGuard};
pub use bus::{Bus, BusGuard, DeviceId};
pub use config::{DurationRange, Runtime, SimulationConfig, ValidConfig};
pub use coordinator::{run, Simulation, SimulationReport};
pub use device::{Device, DevicePhase, WorkerReport};
pub use error::{BusError, ConfigError, SimulationError, WorkerError};
pub use shutdown::Shutdown;
