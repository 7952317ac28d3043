//! Pre-write cooldown tracking

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::template::hints::PreWriteRule;

/// When each pre-write rule last fired, keyed by trigger id
#[derive(Debug, Default)]
pub struct PreWriteTracker {
    fired: HashMap<String, Instant>,
}

impl PreWriteTracker {
    /// The auxiliaries run unless the rule fired within its cooldown
    pub fn should_fire(&self, rule: &PreWriteRule, now: Instant) -> bool {
        match self.fired.get(&rule.trigger) {
            Some(at) => now.duration_since(*at) >= Duration::from_millis(rule.cooldown_ms),
            None => true,
        }
    }

    pub fn mark_fired(&mut self, trigger: &str, now: Instant) {
        self.fired.insert(trigger.to_string(), now);
    }

    /// The auxiliaries never reached the device; run them on the next trigger
    pub fn forget(&mut self, trigger: &str) {
        self.fired.remove(trigger);
    }
}
