//! Clock abstraction so cache expiry and `last_used` bookkeeping can be
//! driven deterministically from tests.

#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use std::time::Duration;
use std::time::{Instant, SystemTime};

/// Source of monotonic and wall-clock time
pub trait TimeProvider: Send + Sync {
    /// Monotonic time, used for TTL arithmetic
    fn now(&self) -> Instant;

    /// Wall-clock time, used for timestamps shown to the operator
    fn system_time(&self) -> SystemTime;
}

/// Production time provider using the real clocks
#[derive(Debug, Default, Clone)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Clone)]
#[cfg(test)]
pub struct MockTimeProvider {
    current_instant: Arc<Mutex<Instant>>,
    current_system_time: Arc<Mutex<SystemTime>>,
}

#[cfg(test)]
impl MockTimeProvider {
    pub fn new() -> Self {
        Self {
            current_instant: Arc::new(Mutex::new(Instant::now())),
            current_system_time: Arc::new(Mutex::new(SystemTime::now())),
        }
    }

    /// Advance both clocks by the given duration
    pub fn advance_time(&self, duration: Duration) {
        {
            let mut instant = self.current_instant.lock().unwrap();
            *instant += duration;
        }
        {
            let mut system_time = self.current_system_time.lock().unwrap();
            *system_time += duration;
        }
    }
}

#[cfg(test)]
impl TimeProvider for MockTimeProvider {
    fn now(&self) -> Instant {
        *self.current_instant.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        *self.current_system_time.lock().unwrap()
    }
}
