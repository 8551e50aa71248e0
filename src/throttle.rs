use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Blocks until `min_interval` has passed since the previous admitted
    /// call, then records the current instant as the new last call.
    pub fn wait(&self) {
        loop {
            let remaining = {
                let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
                let remaining = last
                    .map(|at| self.min_interval.saturating_sub(at.elapsed()))
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    *last = Some(Instant::now());
                    return;
                }
                remaining
            };
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}
