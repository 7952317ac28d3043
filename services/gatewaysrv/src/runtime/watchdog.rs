//! Watchdog ramp and fail-safe state
//!
//! Devices that drop out of remote control when a heartbeat register stops
//! changing get a ramp value written to each active target every interval.
//! Separately, the fail-safe writes a disable value once when the control
//! inputs have been silent for too long.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::template::hints::WatchdogHints;

/// Ramp counter cycling through `[min, max]`
#[derive(Debug, Clone)]
pub struct Ramp {
    min: i64,
    max: i64,
    current: Option<i64>,
}

impl Ramp {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            current: None,
        }
    }

    /// Starts at `min`, wraps back to `min` after `max`
    pub fn next_value(&mut self) -> i64 {
        let next = match self.current {
            Some(c) if c < self.max => c + 1,
            _ => self.min,
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// One-shot fail-safe arming
#[derive(Debug, Clone, Default)]
pub struct FailSafe {
    /// Trigger write the fail-safe last fired for
    fired_for: Option<Instant>,
}

impl FailSafe {
    /// Fires once per burst of trigger activity, when the last trigger write
    /// is older than `silence`.
    ///
    /// Nothing happens until a trigger was written at least once. A new
    /// trigger write after firing re-arms it.
    pub fn evaluate(&mut self, now: Instant, last_trigger: Option<Instant>, silence: Duration) -> bool {
        let Some(last) = last_trigger else {
            return false;
        };
        if self.fired_for == Some(last) {
            return false;
        }
        if now.duration_since(last) > silence {
            self.fired_for = Some(last);
            return true;
        }
        false
    }

    /// The disable write did not reach the device; try again next tick
    pub fn rearm(&mut self) {
        self.fired_for = None;
    }

    pub fn has_fired(&self) -> bool {
        self.fired_for.is_some()
    }
}

/// Watchdog state of one device
#[derive(Debug, Clone)]
pub struct WatchdogState {
    pub ramp: Ramp,
    pub fail_safe: FailSafe,
}

impl WatchdogState {
    pub fn new(hints: &WatchdogHints) -> Self {
        Self {
            ramp: Ramp::new(hints.sequence_min, hints.sequence_max),
            fail_safe: FailSafe::default(),
        }
    }
}

/// Targets whose activation condition holds at `now`.
///
/// A target without activation ids (its own or the watchdog-wide list) is
/// always active. Otherwise one of its activation ids must have been written,
/// within the activation window when one is configured.
pub fn active_targets<'a>(
    hints: &'a WatchdogHints,
    last_writes: &HashMap<String, Instant>,
    now: Instant,
) -> Vec<&'a str> {
    let window = hints.activation_window_ms.map(Duration::from_millis);
    hints
        .targets
        .iter()
        .filter(|target| {
            let ids = if target.activation.is_empty() {
                &hints.activation
            } else {
                &target.activation
            };
            if ids.is_empty() {
                return true;
            }
            ids.iter().filter_map(|id| last_writes.get(id)).any(|at| match window {
                Some(window) => now.duration_since(*at) <= window,
                None => true,
            })
        })
        .map(|target| target.id.as_str())
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_ramp_wraps() {
        let mut ramp = Ramp::new(1, 5);
        let values: Vec<i64> = (0..6).map(|_| ramp.next_value()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 1]);
    }

    #[test]
    fn test_single_value_ramp() {
        let mut ramp = Ramp::new(7, 7);
        assert_eq!(ramp.next_value(), 7);
        assert_eq!(ramp.next_value(), 7);
        ramp.reset();
        assert_eq!(ramp.next_value(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_safe_fires_once() {
        let start = Instant::now();
        let mut fail_safe = FailSafe::default();

        // Never written: never fires
        assert!(!fail_safe.evaluate(start + ms(60_000), None, ms(10_000)));

        let written = start + ms(1000);
        assert!(!fail_safe.evaluate(start + ms(5000), Some(written), ms(10_000)));
        // Exactly at the window boundary is not yet silent for longer
        assert!(!fail_safe.evaluate(start + ms(11_000), Some(written), ms(10_000)));
        assert!(fail_safe.evaluate(start + ms(11_001), Some(written), ms(10_000)));
        assert!(fail_safe.has_fired());
        assert!(!fail_safe.evaluate(start + ms(12_000), Some(written), ms(10_000)));
        assert!(!fail_safe.evaluate(start + ms(90_000), Some(written), ms(10_000)));

        // New activity re-arms
        let rewritten = start + ms(95_000);
        assert!(!fail_safe.evaluate(start + ms(96_000), Some(rewritten), ms(10_000)));
        assert!(fail_safe.evaluate(start + ms(105_001), Some(rewritten), ms(10_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_safe_rearm_after_failed_write() {
        let start = Instant::now();
        let mut fail_safe = FailSafe::default();
        assert!(fail_safe.evaluate(start + ms(101), Some(start), ms(100)));
        fail_safe.rearm();
        assert!(fail_safe.evaluate(start + ms(200), Some(start), ms(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_window() {
        let hints: WatchdogHints = serde_yaml::from_str(
            "interval_ms: 1000\nsequence_max: 5\nactivation: [power_limit]\nactivation_window_ms: 30000\ntargets:\n  - id: heartbeat\n  - id: always\n    activation: []\n  - id: own\n    activation: [run]",
        )
        .unwrap();
        let start = Instant::now();
        let mut writes = HashMap::new();

        // `always` falls back to the shared list, which is empty of writes
        assert!(active_targets(&hints, &writes, start).is_empty());

        writes.insert("power_limit".to_string(), start);
        assert_eq!(
            active_targets(&hints, &writes, start + ms(1000)),
            vec!["heartbeat", "always"]
        );
        assert!(active_targets(&hints, &writes, start + ms(31_000)).is_empty());

        writes.insert("run".to_string(), start + ms(31_000));
        assert_eq!(active_targets(&hints, &writes, start + ms(31_000)), vec!["own"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_without_activation_always_active() {
        let hints: WatchdogHints = serde_yaml::from_str(
            "interval_ms: 1000\nsequence_max: 5\ntargets: [{ id: heartbeat }]",
        )
        .unwrap();
        let writes = HashMap::new();
        assert_eq!(active_targets(&hints, &writes, Instant::now()), vec!["heartbeat"]);
    }
}
