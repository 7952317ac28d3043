//! Shared runtime context
//!
//! Everything that would otherwise be process-global (protocol factories,
//! shared serial buses, SunSpec scale factors, alias rules) lives here and is
//! handed to each device explicitly.

use std::sync::Arc;
use std::time::Duration;

use crate::alias::RuleTable;
use crate::config::DEFAULT_ERROR_LOG_INTERVAL_MS;
use crate::protocols::modbus::{BusRegistry, ScaleFactorRegistry};
use crate::protocols::{create_default_registry, ProtocolRegistry};
use crate::store::SharedStore;

#[derive(Clone)]
pub struct RuntimeContext {
    pub store: SharedStore,
    pub protocols: Arc<ProtocolRegistry>,
    pub buses: Arc<BusRegistry>,
    pub scale_factors: Arc<ScaleFactorRegistry>,
    pub alias_rules: Arc<RuleTable>,
    /// Minimum spacing of identical error log lines per device
    pub error_log_interval: Duration,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("protocols", &self.protocols)
            .field("buses", &self.buses.len())
            .field("error_log_interval", &self.error_log_interval)
            .finish()
    }
}

impl RuntimeContext {
    /// Context with the built-in protocols and alias rules
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            protocols: Arc::new(create_default_registry()),
            buses: Arc::new(BusRegistry::new()),
            scale_factors: Arc::new(ScaleFactorRegistry::new()),
            alias_rules: Arc::new(RuleTable::builtin()),
            error_log_interval: Duration::from_millis(DEFAULT_ERROR_LOG_INTERVAL_MS),
        }
    }

    pub fn with_error_log_interval(mut self, interval: Duration) -> Self {
        self.error_log_interval = interval;
        self
    }

    pub fn with_alias_rules(mut self, rules: RuleTable) -> Self {
        self.alias_rules = Arc::new(rules);
        self
    }
}
