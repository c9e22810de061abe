//! Blocking waits between attempts.

use std::thread;
use std::time::Duration;

use tracing::debug;

pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        thread::sleep(delay);
    }
}
