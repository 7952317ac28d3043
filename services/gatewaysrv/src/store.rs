//! State store contract and in-memory implementation
//!
//! The gateway mirrors every device under `devices.<id>.`:
//!
//! - `devices.<id>.<dpId>` raw data points
//! - `devices.<id>.aliases.<aliasPath>` derived aliases
//! - `devices.<id>.info.connected` / `devices.<id>.info.last_error`
//!
//! Writes made by other parties arrive unacknowledged on the inbound stream.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{GatewayError, Result};
use crate::value::{Value, ValueKind};

pub const DEVICES_ROOT: &str = "devices";
pub const ALIASES_SEGMENT: &str = "aliases";
pub const INFO_SEGMENT: &str = "info";
pub const INFO_CONNECTED: &str = "connected";
pub const INFO_LAST_ERROR: &str = "last_error";

pub fn device_prefix(device_id: &str) -> String {
    format!("{}.{}.", DEVICES_ROOT, device_id)
}

pub fn datapoint_path(device_id: &str, dp_id: &str) -> String {
    format!("{}.{}.{}", DEVICES_ROOT, device_id, dp_id)
}

pub fn alias_path(device_id: &str, alias: &str) -> String {
    format!("{}.{}.{}.{}", DEVICES_ROOT, device_id, ALIASES_SEGMENT, alias)
}

pub fn info_path(device_id: &str, key: &str) -> String {
    format!("{}.{}.{}.{}", DEVICES_ROOT, device_id, INFO_SEGMENT, key)
}

/// What a store path under a device refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    Datapoint(String),
    Alias(String),
    Info(String),
}

/// Split `devices.<id>.<rest>` into the device id and its target
pub fn parse_device_path(path: &str) -> Option<(&str, DeviceTarget)> {
    let rest = path.strip_prefix(DEVICES_ROOT)?.strip_prefix('.')?;
    let (device_id, rest) = rest.split_once('.')?;
    if device_id.is_empty() || rest.is_empty() {
        return None;
    }
    let target = match rest.split_once('.') {
        Some((ALIASES_SEGMENT, alias)) if !alias.is_empty() => DeviceTarget::Alias(alias.to_string()),
        Some((INFO_SEGMENT, key)) if !key.is_empty() => DeviceTarget::Info(key.to_string()),
        Some(_) => return None,
        None => DeviceTarget::Datapoint(rest.to_string()),
    };
    Some((device_id, target))
}

/// Object metadata announced before the first state is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub readable: bool,
    pub writable: bool,
}

impl ObjectMeta {
    pub fn read_only(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: None,
            role: None,
            readable: true,
            writable: false,
        }
    }
}

/// A stored state
#[derive(Debug, Clone, PartialEq)]
pub struct StateValue {
    pub value: Value,
    /// `true` when confirmed by the gateway, `false` for pending external writes
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

/// An unacknowledged write made by another party
#[derive(Debug, Clone, PartialEq)]
pub struct InboundWrite {
    pub path: String,
    pub value: Value,
}

/// External state store
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Create the object if missing, update its metadata otherwise
    async fn ensure_object(&self, path: &str, meta: ObjectMeta) -> Result<()>;

    async fn set_state(&self, path: &str, value: Value, ack: bool) -> Result<()>;

    /// Deliver unacknowledged writes below `prefix` on the inbound stream
    async fn subscribe(&self, prefix: &str) -> Result<()>;

    /// Take the inbound stream; only the first caller gets it
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundWrite>>;
}

/// In-process store used by the binary and the tests
pub struct MemoryStore {
    objects: DashMap<String, ObjectMeta>,
    states: DashMap<String, StateValue>,
    subscriptions: DashSet<String>,
    inbound_tx: mpsc::UnboundedSender<InboundWrite>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundWrite>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("objects", &self.objects.len())
            .field("states", &self.states.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            objects: DashMap::new(),
            states: DashMap::new(),
            subscriptions: DashSet::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn get_state(&self, path: &str) -> Option<StateValue> {
        self.states.get(path).map(|s| s.clone())
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.states.get(path).map(|s| s.value.clone())
    }

    pub fn object(&self, path: &str) -> Option<ObjectMeta> {
        self.objects.get(path).map(|o| o.clone())
    }

    /// Sorted state paths below a prefix
    pub fn paths(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    /// Simulate a user or another adapter writing a state
    pub fn write_from_outside(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if !self.objects.contains_key(path) {
            return Err(GatewayError::store(format!("No object at '{}'", path)));
        }
        self.states.insert(
            path.to_string(),
            StateValue {
                value: value.clone(),
                ack: false,
                ts: Utc::now(),
            },
        );
        let subscribed = self
            .subscriptions
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));
        if subscribed {
            self.inbound_tx
                .send(InboundWrite {
                    path: path.to_string(),
                    value,
                })
                .map_err(|_| GatewayError::store("Inbound stream closed"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ensure_object(&self, path: &str, meta: ObjectMeta) -> Result<()> {
        self.objects.insert(path.to_string(), meta);
        Ok(())
    }

    async fn set_state(&self, path: &str, value: Value, ack: bool) -> Result<()> {
        trace!("{} = {} (ack={})", path, value, ack);
        self.states.insert(
            path.to_string(),
            StateValue {
                value,
                ack,
                ts: Utc::now(),
            },
        );
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<()> {
        self.subscriptions.insert(prefix.to_string());
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundWrite>> {
        self.inbound_rx.lock().take()
    }
}

/// Shared store handle
pub type SharedStore = Arc<dyn StateStore>;

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(datapoint_path("inv1", "W"), "devices.inv1.W");
        assert_eq!(alias_path("inv1", "r.power"), "devices.inv1.aliases.r.power");
        assert_eq!(info_path("inv1", INFO_CONNECTED), "devices.inv1.info.connected");
        assert_eq!(device_prefix("inv1"), "devices.inv1.");
    }

    #[test]
    fn test_parse_device_path() {
        assert_eq!(
            parse_device_path("devices.inv1.W"),
            Some(("inv1", DeviceTarget::Datapoint("W".into())))
        );
        assert_eq!(
            parse_device_path("devices.inv1.aliases.ctrl.run"),
            Some(("inv1", DeviceTarget::Alias("ctrl.run".into())))
        );
        assert_eq!(
            parse_device_path("devices.inv1.info.connected"),
            Some(("inv1", DeviceTarget::Info("connected".into())))
        );
        assert_eq!(parse_device_path("devices.inv1"), None);
        assert_eq!(parse_device_path("system.inv1.W"), None);
        assert_eq!(parse_device_path("devices.inv1.W.extra"), None);
    }

    #[tokio::test]
    async fn test_outside_writes_reach_subscribers() {
        let store = MemoryStore::new();
        let mut inbound = store.take_inbound().unwrap();
        assert!(store.take_inbound().is_none());

        store
            .ensure_object("devices.a.x", ObjectMeta::read_only("x", ValueKind::Number))
            .await
            .unwrap();
        store
            .ensure_object("other.y", ObjectMeta::read_only("y", ValueKind::Number))
            .await
            .unwrap();
        store.subscribe("devices.a.").await.unwrap();

        store.write_from_outside("other.y", 1i64).unwrap();
        store.write_from_outside("devices.a.x", 7i64).unwrap();

        let write = inbound.recv().await.unwrap();
        assert_eq!(write.path, "devices.a.x");
        assert_eq!(write.value, Value::Int(7));
        assert!(inbound.try_recv().is_err());

        let state = store.get_state("devices.a.x").unwrap();
        assert!(!state.ack);
    }

    #[tokio::test]
    async fn test_write_to_unknown_object_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.write_from_outside("devices.a.nope", 1i64),
            Err(GatewayError::StateStore(_))
        ));
    }

    #[tokio::test]
    async fn test_set_state_and_paths() {
        let store = MemoryStore::new();
        store.set_state("devices.a.y", Value::Int(2), true).await.unwrap();
        store.set_state("devices.a.x", Value::Int(1), true).await.unwrap();
        store.set_state("devices.b.x", Value::Int(3), true).await.unwrap();
        assert_eq!(store.paths("devices.a."), vec!["devices.a.x", "devices.a.y"]);
        assert_eq!(store.value("devices.b.x"), Some(Value::Int(3)));
        assert!(store.get_state("devices.a.x").unwrap().ack);
    }
}
