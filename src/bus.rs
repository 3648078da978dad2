//! Blocking binary semaphore guarding the shared bus.
//!
//! A device takes the bus with [`Bus::acquire`] and gets back a [`BusGuard`].
//! The guard gives the bus back when it is dropped, so the bus is released on
//! every path out of the held section, unwinding included.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::error::BusError;

/// Units of bus capacity. The bus admits a single holder.
pub const CAPACITY: usize = 1;

/// Identity of a device, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(usize);

impl DeviceId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct State {
    available: usize,
    holder: Option<DeviceId>,
}

impl State {
    fn take(&mut self, holder: DeviceId) {
        debug_assert_eq!(self.available, CAPACITY);
        debug_assert!(self.holder.is_none());
        self.available -= 1;
        self.holder = Some(holder);
    }

    fn give_back(&mut self, holder: DeviceId) -> Result<(), BusError> {
        if self.holder != Some(holder) {
            return Err(BusError::Misuse {
                device: holder,
                holder: self.holder,
            });
        }
        self.available += 1;
        self.holder = None;
        debug_assert_eq!(self.available, CAPACITY);
        Ok(())
    }
}

pub struct Bus {
    state: Mutex<State>,
    freed: Condvar,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                available: CAPACITY,
                holder: None,
            }),
            freed: Condvar::new(),
        }
    }

    /// Blocks until the bus is free, then takes it for `holder`.
    pub fn acquire(&self, holder: DeviceId) -> BusGuard<'_> {
        let mut state = self.lock_state();
        while state.available == 0 {
            state = self
                .freed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.take(holder);
        trace!(device = %holder, "bus taken");

        BusGuard::new(self, holder)
    }

    /// Like [`Bus::acquire`], but gives up once `timeout` has elapsed.
    pub fn acquire_timeout(
        &self,
        holder: DeviceId,
        timeout: Duration,
    ) -> Result<BusGuard<'_>, BusError> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);

        let mut state = self.lock_state();
        while state.available == 0 {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::Timeout {
                            device: holder,
                            waited: now - started,
                        });
                    }
                    deadline - now
                }
                None => timeout,
            };
            let (next, _) = self
                .freed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state.take(holder);
        trace!(device = %holder, "bus taken");

        Ok(BusGuard::new(self, holder))
    }

    /// Takes the bus only if nobody holds it right now.
    pub fn try_acquire(&self, holder: DeviceId) -> Option<BusGuard<'_>> {
        let mut state = self.lock_state();
        if state.available == 0 {
            return None;
        }
        state.take(holder);
        trace!(device = %holder, "bus taken");

        Some(BusGuard::new(self, holder))
    }

    /// Gives the bus back on behalf of `holder` and wakes one waiter.
    ///
    /// Fails with [`BusError::Misuse`] when `holder` does not currently hold
    /// the bus; the bus state is left untouched in that case.
    pub fn release(&self, holder: DeviceId) -> Result<(), BusError> {
        let mut state = self.lock_state();
        state.give_back(holder)?;
        drop(state);

        trace!(device = %holder, "bus returned");
        self.freed.notify_one();
        Ok(())
    }

    // No caller code runs while the state lock is held, so a poisoned lock
    // still guards a consistent state.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Bus")
            .field("available", &state.available)
            .field("holder", &state.holder)
            .finish()
    }
}

/// Exclusive hold on the bus. Dropping it releases the bus.
#[must_use = "the bus is released as soon as the guard is dropped"]
pub struct BusGuard<'a> {
    bus: &'a Bus,
    holder: DeviceId,
    released: bool,
}

impl<'a> BusGuard<'a> {
    fn new(bus: &'a Bus, holder: DeviceId) -> Self {
        Self {
            bus,
            holder,
            released: false,
        }
    }

    pub fn holder(&self) -> DeviceId {
        self.holder
    }

    /// Releases the bus now and reports misuse instead of logging it.
    pub fn release(mut self) -> Result<(), BusError> {
        self.released = true;
        self.bus.release(self.holder)
    }
}

impl<'a> Drop for BusGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.bus.release(self.holder) {
            error!(device = %self.holder, "dropping bus guard: {}", e);
        }
    }
}
