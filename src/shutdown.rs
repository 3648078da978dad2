use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::TERM_SIGNALS;

/// Process exit status when a second termination signal arrives.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Stop request shared by the coordinator and every device. Devices check it
/// between attempts, never while holding the bus.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Turns SIGINT, SIGTERM and SIGQUIT into a stop request. A second
    /// signal, once a stop is already pending, exits the process with
    /// [`EXIT_INTERRUPTED`].
    pub fn register_signals(&self) -> io::Result<()> {
        for &signal in TERM_SIGNALS {
            // Registered first so it sees the flag before this signal sets it.
            signal_hook::flag::register_conditional_shutdown(
                signal,
                EXIT_INTERRUPTED,
                Arc::clone(&self.flag),
            )?;
            signal_hook::flag::register(signal, Arc::clone(&self.flag))?;
        }
        Ok(())
    }
}
