//! What a device does while thinking and while it holds the bus.
//!
//! The defaults just sleep. Tests swap in activities that instrument the held
//! section or fail inside it.

use std::thread;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::bus::DeviceId;

/// One think, acquire, hold, release cycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub device: DeviceId,
    /// Counts from 1.
    pub number: u32,
    pub think: Duration,
    pub hold: Duration,
}

/// Blocking activity for devices running on their own thread.
pub trait Activity: Send + Sync {
    fn think(&self, attempt: &Attempt) -> anyhow::Result<()> {
        thread::sleep(attempt.think);
        Ok(())
    }

    /// Runs with the bus held.
    fn hold(&self, attempt: &Attempt) -> anyhow::Result<()> {
        thread::sleep(attempt.hold);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sleep;

impl Activity for Sleep {}

/// Activity for devices running as tokio tasks.
pub trait AsyncActivity: Send + Sync {
    fn think<'a>(&'a self, attempt: &'a Attempt) -> BoxFuture<'a, anyhow::Result<()>> {
        tokio::time::sleep(attempt.think).map(Ok).boxed()
    }

    /// Runs with the bus held.
    fn hold<'a>(&'a self, attempt: &'a Attempt) -> BoxFuture<'a, anyhow::Result<()>> {
        tokio::time::sleep(attempt.hold).map(Ok).boxed()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

impl AsyncActivity for TokioSleep {}
