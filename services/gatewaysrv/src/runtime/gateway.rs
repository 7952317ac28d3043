//! Gateway orchestration
//!
//! Starts the configured devices and routes unacknowledged store writes to
//! the device they address.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DeviceConfig};
use crate::error::{GatewayError, Result};
use crate::protocols::ProtocolRegistry;
use crate::runtime::context::RuntimeContext;
use crate::runtime::device::DeviceRuntime;
use crate::store::{parse_device_path, DeviceTarget, InboundWrite};
use crate::template::TemplateCatalog;
use crate::value::Value;

type Inbox = mpsc::UnboundedSender<(DeviceTarget, Value)>;

/// Running devices plus the inbound write router
pub struct Gateway {
    ctx: RuntimeContext,
    devices: DashMap<String, Arc<DeviceRuntime>>,
    inboxes: Arc<DashMap<String, Inbox>>,
    router: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("devices", &self.device_ids())
            .finish()
    }
}

impl Gateway {
    /// Create the gateway and start routing inbound writes.
    ///
    /// Must be called inside a Tokio runtime. Only one gateway per store can
    /// receive inbound writes.
    pub fn new(ctx: RuntimeContext) -> Self {
        let inboxes: Arc<DashMap<String, Inbox>> = Arc::new(DashMap::new());
        let router = match ctx.store.take_inbound() {
            Some(inbound) => Some(spawn_router(inboxes.clone(), inbound)),
            None => {
                warn!("Inbound writes already consumed elsewhere; device writes are disabled");
                None
            },
        };
        Self {
            ctx,
            devices: DashMap::new(),
            inboxes,
            router: Mutex::new(router),
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Start every enabled device
    ///
    /// A device whose configuration, template or driver is invalid is logged
    /// and skipped; the remaining devices start normally.
    ///
    /// ```text
    /// ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
    /// │ DeviceConfig│──►│ TemplateCat. │──►│ ProtocolReg.  │
    /// └─────────────┘   └──────────────┘   └───────┬───────┘
    ///                                              ▼
    ///                                      ┌───────────────┐
    ///                                      │ DeviceRuntime │
    ///                                      └───────────────┘
    /// ```
    ///
    /// Returns the devices that failed to start with their errors.
    pub async fn start(
        &self,
        config: &AppConfig,
        catalog: &TemplateCatalog,
    ) -> Vec<(String, GatewayError)> {
        let mut failures = Vec::new();
        let mut started = 0usize;
        for device in &config.devices {
            if !device.enabled {
                info!("Device '{}' disabled, skipping", device.id);
                continue;
            }
            match self.start_device(device, catalog).await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!("Device '{}' not started: {}", device.id, e);
                    failures.push((device.id.clone(), e));
                },
            }
        }
        info!(
            "Gateway started: {} devices running, {} failed",
            started,
            failures.len()
        );
        failures
    }

    pub async fn start_device(&self, device: &DeviceConfig, catalog: &TemplateCatalog) -> Result<()> {
        if self.devices.contains_key(&device.id) {
            return Err(GatewayError::config(format!(
                "Device '{}' is already running",
                device.id
            )));
        }
        let template = catalog.get(&device.template).ok_or_else(|| {
            GatewayError::config(format!(
                "Device '{}': template '{}' not found or invalid",
                device.id, device.template
            ))
        })?;
        let runtime = Arc::new(DeviceRuntime::start(device, template, &self.ctx).await?);
        self.register(runtime);
        Ok(())
    }

    /// Track an already started device and route its writes
    pub fn register(&self, runtime: Arc<DeviceRuntime>) {
        let id = runtime.id().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_device_inbox(runtime.clone(), rx);
        self.inboxes.insert(id.clone(), tx);
        if let Some(previous) = self.devices.insert(id, runtime) {
            previous.stop();
        }
    }

    pub fn device(&self, id: &str) -> Option<Arc<DeviceRuntime>> {
        self.devices.get(id).map(|entry| entry.value().clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stop one device; `false` if it was not running
    pub fn stop_device(&self, id: &str) -> bool {
        self.inboxes.remove(id);
        match self.devices.remove(id) {
            Some((_, runtime)) => {
                runtime.stop();
                true
            },
            None => false,
        }
    }

    /// Stop routing and every device; safe to call repeatedly
    pub fn stop_all(&self) {
        if let Some((_, token)) = self.router.lock().take() {
            token.cancel();
        }
        self.inboxes.clear();
        let ids = self.device_ids();
        for id in &ids {
            if let Some((_, runtime)) = self.devices.remove(id) {
                runtime.stop();
            }
        }
        if !ids.is_empty() {
            info!("Stopped {} devices", ids.len());
        }
    }
}

/// Offline checks of the configured devices against templates and protocols.
///
/// Nothing is connected; used by `--validate`.
pub fn check_devices(
    config: &AppConfig,
    catalog: &TemplateCatalog,
    protocols: &ProtocolRegistry,
) -> Vec<(String, GatewayError)> {
    let mut problems = Vec::new();
    for device in config.devices.iter().filter(|d| d.enabled) {
        let checked = device.validate().and_then(|()| {
            if !protocols.is_registered(&device.protocol) {
                return Err(GatewayError::config(format!(
                    "unknown protocol '{}'",
                    device.protocol
                )));
            }
            if catalog.get(&device.template).is_none() {
                return Err(GatewayError::config(format!(
                    "template '{}' not found or invalid",
                    device.template
                )));
            }
            Ok(())
        });
        if let Err(e) = checked {
            problems.push((device.id.clone(), e));
        }
    }
    problems
}

fn spawn_router(
    inboxes: Arc<DashMap<String, Inbox>>,
    mut inbound: mpsc::UnboundedReceiver<InboundWrite>,
) -> (JoinHandle<()>, CancellationToken) {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        loop {
            let write = tokio::select! {
                write = inbound.recv() => match write {
                    Some(write) => write,
                    None => break,
                },
                () = task_token.cancelled() => break,
            };
            let Some((device_id, target)) = parse_device_path(&write.path) else {
                debug!("Ignoring write to '{}'", write.path);
                continue;
            };
            let delivered = inboxes
                .get(device_id)
                .map(|inbox| inbox.send((target, write.value)).is_ok())
                .unwrap_or(false);
            if !delivered {
                warn!("Write to '{}' for a device that is not running", write.path);
            }
        }
        debug!("Inbound write router stopped");
    });
    (handle, token)
}

/// Writes to one device are handled in arrival order
fn spawn_device_inbox(
    runtime: Arc<DeviceRuntime>,
    mut rx: mpsc::UnboundedReceiver<(DeviceTarget, Value)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((target, value)) = rx.recv().await {
            if runtime.is_stopped() {
                break;
            }
            if let Err(e) = runtime.handle_write(target, value).await {
                debug!("[{}] write not applied: {}", runtime.id(), e);
            }
        }
    })
}
