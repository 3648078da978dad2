//! Async counterpart of [`Bus`](crate::bus::Bus) for devices running as
//! tokio tasks. Capacity lives in a one-permit `tokio::sync::Semaphore`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{error, trace};

use crate::bus::{DeviceId, CAPACITY};
use crate::error::BusError;

pub struct AsyncBus {
    permits: Semaphore,
    holder: Mutex<Option<DeviceId>>,
}

impl AsyncBus {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(CAPACITY),
            holder: Mutex::new(None),
        }
    }

    /// Waits until the bus is free, then takes it for `holder`.
    ///
    /// Fails only once the bus has been closed.
    pub async fn acquire(&self, holder: DeviceId) -> Result<AsyncBusGuard<'_>, BusError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BusError::Closed { device: holder })?;
        permit.forget();

        Ok(self.take(holder))
    }

    /// Like [`AsyncBus::acquire`], but gives up once `timeout` has elapsed.
    pub async fn acquire_timeout(
        &self,
        holder: DeviceId,
        timeout: Duration,
    ) -> Result<AsyncBusGuard<'_>, BusError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.acquire(holder)).await {
            Ok(guard) => guard,
            Err(_) => Err(BusError::Timeout {
                device: holder,
                waited: started.elapsed(),
            }),
        }
    }

    pub fn try_acquire(&self, holder: DeviceId) -> Option<AsyncBusGuard<'_>> {
        let permit = self.permits.try_acquire().ok()?;
        permit.forget();

        Some(self.take(holder))
    }

    /// Gives the bus back on behalf of `holder` and wakes one waiter.
    pub fn release(&self, holder: DeviceId) -> Result<(), BusError> {
        let mut current = self.lock_holder();
        if *current != Some(holder) {
            return Err(BusError::Misuse {
                device: holder,
                holder: *current,
            });
        }
        *current = None;
        drop(current);

        trace!(device = %holder, "bus returned");
        self.permits.add_permits(1);
        Ok(())
    }

    /// Closes the bus. Pending and future acquisitions fail with
    /// [`BusError::Closed`]; a current holder may still release.
    pub fn close(&self) {
        self.permits.close();
    }

    fn take(&self, holder: DeviceId) -> AsyncBusGuard<'_> {
        let mut current = self.lock_holder();
        debug_assert!(current.is_none());
        *current = Some(holder);
        drop(current);

        trace!(device = %holder, "bus taken");
        AsyncBusGuard {
            bus: self,
            holder,
            released: false,
        }
    }

    fn lock_holder(&self) -> MutexGuard<'_, Option<DeviceId>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AsyncBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBus")
            .field("available", &self.permits.available_permits())
            .field("holder", &*self.lock_holder())
            .finish()
    }
}

#[must_use = "the bus is released as soon as the guard is dropped"]
pub struct AsyncBusGuard<'a> {
    bus: &'a AsyncBus,
    holder: DeviceId,
    released: bool,
}

impl<'a> AsyncBusGuard<'a> {
    pub fn holder(&self) -> DeviceId {
        self.holder
    }

    pub fn release(mut self) -> Result<(), BusError> {
        self.released = true;
        self.bus.release(self.holder)
    }
}

impl<'a> Drop for AsyncBusGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.bus.release(self.holder) {
            error!(device = %self.holder, "dropping bus guard: {}", e);
        }
    }
}
