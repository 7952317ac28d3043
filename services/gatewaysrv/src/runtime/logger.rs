//! Per-device logging
//!
//! Every line carries the device id. Identical error messages are throttled so
//! a device that stays offline does not flood the log; the error state in the
//! store is updated regardless.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_ERROR_LOG_INTERVAL_MS;

/// Suppresses repeats of the same message within an interval
#[derive(Debug)]
pub struct ErrorLogLimiter {
    interval: Duration,
    last: HashMap<String, (Instant, u64)>,
}

impl Default for ErrorLogLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_ERROR_LOG_INTERVAL_MS))
    }
}

impl ErrorLogLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Whether `message` should be logged now.
    ///
    /// Returns `Some(suppressed)` with the number of repeats swallowed since
    /// the last time it was logged, or `None` to stay quiet.
    pub fn check(&mut self, message: &str, now: Instant) -> Option<u64> {
        match self.last.get_mut(message) {
            Some((logged_at, suppressed)) if now.duration_since(*logged_at) < self.interval => {
                *suppressed += 1;
                None
            },
            Some((logged_at, suppressed)) => {
                let count = *suppressed;
                *logged_at = now;
                *suppressed = 0;
                Some(count)
            },
            None => {
                self.last.insert(message.to_string(), (now, 0));
                Some(0)
            },
        }
    }

    /// Forget all history (after recovery the next failure is logged at once)
    pub fn reset(&mut self) {
        self.last.clear();
    }
}

/// Logger bound to one device
#[derive(Debug)]
pub struct DeviceLogger {
    device_id: String,
    limiter: Mutex<ErrorLogLimiter>,
}

impl DeviceLogger {
    pub fn new(device_id: &str, error_interval: Duration) -> Self {
        Self {
            device_id: device_id.to_string(),
            limiter: Mutex::new(ErrorLogLimiter::new(error_interval)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn log_init(&self, protocol: &str, message: &str) {
        info!("[{}] [INIT] {} - {}", self.device_id, protocol, message);
    }

    pub fn log_status(&self, connected: bool, reason: &str) {
        let state = if connected { "online" } else { "offline" };
        info!("[{}] [STATUS] {} - {}", self.device_id, state, reason);
    }

    pub fn log_write(&self, dp_id: &str, detail: &str) {
        debug!("[{}] [WRITE] {} {}", self.device_id, dp_id, detail);
    }

    pub fn log_warn(&self, message: &str) {
        warn!("[{}] {}", self.device_id, message);
    }

    /// Rate-limited error line
    pub fn log_error(&self, operation: &str, message: &str) {
        let key = format!("{}: {}", operation, message);
        let verdict = self.limiter.lock().check(&key, Instant::now());
        match verdict {
            Some(0) => error!("[{}] {}", self.device_id, key),
            Some(suppressed) => error!(
                "[{}] {} ({} repeats suppressed)",
                self.device_id, key, suppressed
            ),
            None => debug!("[{}] {} (repeat)", self.device_id, key),
        }
    }

    pub fn reset_errors(&self) {
        self.limiter.lock().reset();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    async fn test_limiter_suppresses_repeats() {
        let mut limiter = ErrorLogLimiter::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.check("timeout", start), Some(0));
        assert_eq!(limiter.check("timeout", start + Duration::from_secs(10)), None);
        assert_eq!(limiter.check("timeout", start + Duration::from_secs(30)), None);
        // Different messages are independent
        assert_eq!(limiter.check("refused", start + Duration::from_secs(30)), Some(0));
        assert_eq!(
            limiter.check("timeout", start + Duration::from_secs(61)),
            Some(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_reset() {
        let mut limiter = ErrorLogLimiter::default();
        let now = Instant::now();
        assert_eq!(limiter.check("x", now), Some(0));
        assert_eq!(limiter.check("x", now), None);
        limiter.reset();
        assert_eq!(limiter.check("x", now), Some(0));
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn test_device_logger_rate_limits() {
        let logger = DeviceLogger::new("inv1", Duration::from_secs(60));
        logger.log_error("poll", "Transport error: Timeout");
        logger.log_error("poll", "Transport error: Timeout");
        assert!(logs_contain("[inv1] poll: Transport error: Timeout"));
        assert!(logs_contain("(repeat)"));
    }
}
