//! Typed driver hints
//!
//! Hints tune the per-device scheduler: poll tiers, write throttling, pre-write
//! rules, the watchdog and Modbus batching limits. Unknown keys are rejected
//! when the template is parsed; cross references are checked by
//! [`DriverHints::validate`] once the data points are known.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::protocols::modbus::constants::{
    DEFAULT_MAX_READ_BITS, DEFAULT_MAX_READ_REGISTERS, MAX_READ_COILS, MAX_READ_REGISTERS,
};
use crate::template::DatapointDef;
use crate::value::Value;

fn default_max_per_tick() -> usize {
    1
}

fn default_sequence_min() -> i64 {
    1
}

fn default_max_read_registers() -> u16 {
    DEFAULT_MAX_READ_REGISTERS
}

fn default_max_read_bits() -> u16 {
    DEFAULT_MAX_READ_BITS
}

/// All hints of a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverHints {
    #[serde(default)]
    pub poll: PollHints,
    #[serde(default)]
    pub write: WriteHints,
    #[serde(default)]
    pub pre_writes: Vec<PreWriteRule>,
    #[serde(default)]
    pub watchdog: Option<WatchdogHints>,
    #[serde(default)]
    pub modbus: ModbusHints,
}

/// Poll timing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollHints {
    /// Fast tier interval (overridden by the device poll interval)
    #[serde(default)]
    pub fast_interval_ms: Option<u64>,
    /// Slow tier interval; needs `fast_ids` to take effect
    #[serde(default)]
    pub slow_interval_ms: Option<u64>,
    /// Data points read on every fast tick when a slow tier exists
    #[serde(default)]
    pub fast_ids: Vec<String>,
    /// Strict command cadence: at most one physical command per tick
    #[serde(default)]
    pub command_interval_ms: Option<u64>,
}

/// Write throttling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteHints {
    /// Queue writes and drain them on this period (0 = write immediately)
    #[serde(default)]
    pub throttle_ms: u64,
    /// Entries drained per throttle tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
}

impl Default for WriteHints {
    fn default() -> Self {
        Self {
            throttle_ms: 0,
            max_per_tick: default_max_per_tick(),
        }
    }
}

/// One auxiliary write of a pre-write rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuxWrite {
    pub id: String,
    pub value: Value,
}

/// Writes that must precede a write to `trigger`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreWriteRule {
    pub trigger: String,
    /// Skip the auxiliaries if the rule fired less than this long ago
    #[serde(default)]
    pub cooldown_ms: u64,
    pub writes: Vec<AuxWrite>,
}

/// A register the watchdog keeps alive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogTarget {
    pub id: String,
    /// Activation ids for this target; falls back to the watchdog-wide list
    #[serde(default)]
    pub activation: Vec<String>,
}

/// One-shot disable write after trigger silence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailSafeHints {
    /// Data points whose writes arm the fail-safe
    pub triggers: Vec<String>,
    /// Silence after the last trigger write before the disable value is sent
    pub silence_ms: u64,
    pub target: String,
    pub value: Value,
}

/// Periodic keep-alive writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogHints {
    pub interval_ms: u64,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_sequence_min")]
    pub sequence_min: i64,
    pub sequence_max: i64,
    #[serde(default)]
    pub targets: Vec<WatchdogTarget>,
    /// Default activation ids for targets without their own
    #[serde(default)]
    pub activation: Vec<String>,
    /// Targets only tick while an activation id was written within this window
    #[serde(default)]
    pub activation_window_ms: Option<u64>,
    #[serde(default)]
    pub fail_safe: Option<FailSafeHints>,
}

impl WatchdogHints {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Modbus batching limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusHints {
    #[serde(default = "default_max_read_registers")]
    pub max_read_registers: u16,
    #[serde(default = "default_max_read_bits")]
    pub max_read_bits: u16,
    #[serde(default)]
    pub max_gap: u16,
}

impl Default for ModbusHints {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_read_bits: DEFAULT_MAX_READ_BITS,
            max_gap: 0,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

fn lookup<'a>(datapoints: &'a [DatapointDef], id: &str, context: &str) -> Result<&'a DatapointDef> {
    datapoints
        .iter()
        .find(|dp| dp.id == id)
        .ok_or_else(|| GatewayError::config(format!("{}: unknown data point '{}'", context, id)))
}

fn writable<'a>(datapoints: &'a [DatapointDef], id: &str, context: &str) -> Result<&'a DatapointDef> {
    let dp = lookup(datapoints, id, context)?;
    if !dp.rw.is_writable() {
        return Err(GatewayError::config(format!(
            "{}: data point '{}' is not writable",
            context, id
        )));
    }
    Ok(dp)
}

fn positive(value: Option<u64>, name: &str) -> Result<()> {
    if value == Some(0) {
        return Err(GatewayError::config(format!("{} must be positive", name)));
    }
    Ok(())
}

impl DriverHints {
    /// Check ranges and cross references against the template's data points
    pub fn validate(&self, datapoints: &[DatapointDef]) -> Result<()> {
        positive(self.poll.fast_interval_ms, "poll.fast_interval_ms")?;
        positive(self.poll.slow_interval_ms, "poll.slow_interval_ms")?;
        positive(self.poll.command_interval_ms, "poll.command_interval_ms")?;
        for id in &self.poll.fast_ids {
            lookup(datapoints, id, "poll.fast_ids")?;
        }

        if self.write.max_per_tick == 0 {
            return Err(GatewayError::config("write.max_per_tick must be at least 1"));
        }

        for rule in &self.pre_writes {
            writable(datapoints, &rule.trigger, "pre_writes.trigger")?;
            if rule.writes.is_empty() {
                return Err(GatewayError::config(format!(
                    "pre_writes for '{}' has no writes",
                    rule.trigger
                )));
            }
            for aux in &rule.writes {
                writable(datapoints, &aux.id, "pre_writes.writes")?;
                if aux.id == rule.trigger {
                    return Err(GatewayError::config(format!(
                        "pre_writes for '{}' writes its own trigger",
                        rule.trigger
                    )));
                }
            }
        }

        if let Some(watchdog) = &self.watchdog {
            if watchdog.interval_ms == 0 {
                return Err(GatewayError::config("watchdog.interval_ms must be positive"));
            }
            if watchdog.sequence_min > watchdog.sequence_max {
                return Err(GatewayError::config(format!(
                    "watchdog ramp [{}, {}] is empty",
                    watchdog.sequence_min, watchdog.sequence_max
                )));
            }
            positive(watchdog.activation_window_ms, "watchdog.activation_window_ms")?;
            for target in &watchdog.targets {
                writable(datapoints, &target.id, "watchdog.targets")?;
                for id in &target.activation {
                    lookup(datapoints, id, "watchdog.targets.activation")?;
                }
            }
            for id in &watchdog.activation {
                lookup(datapoints, id, "watchdog.activation")?;
            }
            if let Some(fail_safe) = &watchdog.fail_safe {
                writable(datapoints, &fail_safe.target, "watchdog.fail_safe.target")?;
                if fail_safe.triggers.is_empty() {
                    return Err(GatewayError::config("watchdog.fail_safe needs triggers"));
                }
                for id in &fail_safe.triggers {
                    lookup(datapoints, id, "watchdog.fail_safe.triggers")?;
                }
                if fail_safe.silence_ms == 0 {
                    return Err(GatewayError::config(
                        "watchdog.fail_safe.silence_ms must be positive",
                    ));
                }
            }
            if watchdog.targets.is_empty() && watchdog.fail_safe.is_none() {
                return Err(GatewayError::config(
                    "watchdog has neither targets nor a fail_safe",
                ));
            }
        }

        let modbus = &self.modbus;
        if modbus.max_read_registers == 0 || modbus.max_read_registers > MAX_READ_REGISTERS {
            return Err(GatewayError::config(format!(
                "modbus.max_read_registers must be 1-{}",
                MAX_READ_REGISTERS
            )));
        }
        if modbus.max_read_bits == 0 || modbus.max_read_bits > MAX_READ_COILS {
            return Err(GatewayError::config(format!(
                "modbus.max_read_bits must be 1-{}",
                MAX_READ_COILS
            )));
        }
        Ok(())
    }

    /// Slow tier exists only with both a slow interval and a fast subset
    pub fn has_slow_tier(&self) -> bool {
        self.poll.slow_interval_ms.is_some() && !self.poll.fast_ids.is_empty()
    }

    pub fn pre_write_rule(&self, trigger: &str) -> Option<&PreWriteRule> {
        self.pre_writes.iter().find(|rule| rule.trigger == trigger)
    }
}
