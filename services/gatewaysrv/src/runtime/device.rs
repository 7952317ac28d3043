//! Per-device runtime
//!
//! One [`DeviceRuntime`] owns one driver and runs its background tasks:
//!
//! ```text
//!                 ┌──────────────┐
//!  inbound ──────►│ handle_write │──► immediate write ─┐
//!  writes         └──────┬───────┘                      │
//!                        │ throttled                    ▼
//!                        ▼                     ┌─────────────────┐
//!                 ┌──────────────┐  drain      │ driver (locked  │
//!                 │ WriteQueue   │────────────►│ per operation)  │
//!                 └──────────────┘             └────────┬────────┘
//!  poll timer ─────────────────── read ────────────────►│
//!  watchdog ───────────────────── write ───────────────►│
//!                                                       ▼
//!                                         store: values, aliases, info
//! ```
//!
//! The driver sits behind an async mutex: a physical operation holds it for
//! its whole duration, so a second operation never overlaps the first.
//!
//! Three scheduling modes exist:
//!
//! - free-running with immediate writes
//! - free-running with throttled writes (queue drained on a fixed period)
//! - command cadence: a single tick issues at most one physical command,
//!   a slow poll if due, else a fast poll if due, else one queued write

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::alias::{AliasContext, AliasSet};
use crate::config::{DeviceConfig, DEFAULT_POLL_INTERVAL_MS};
use crate::driver::Driver;
use crate::error::{GatewayError, Result};
use crate::protocols::modbus::ScaleFactorRegistry;
use crate::runtime::context::RuntimeContext;
use crate::runtime::logger::DeviceLogger;
use crate::runtime::schedule::{PollKind, PollTimer, ScheduleState};
use crate::runtime::watchdog::{active_targets, WatchdogState};
use crate::runtime::write_queue::{AckTarget, Requeue, WriteEntry, WriteQueue};
use crate::store::{
    alias_path, datapoint_path, device_prefix, info_path, DeviceTarget, ObjectMeta, SharedStore,
    INFO_CONNECTED, INFO_LAST_ERROR,
};
use crate::template::hints::WatchdogHints;
use crate::template::{DatapointDef, Template};
use crate::value::{Value, ValueKind, ValueMap};

/// How writes reach the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Immediate,
    /// Queue drained every period
    Throttled(Duration),
    /// Polls and queued writes share one command tick
    Cadence(Duration),
}

impl WriteMode {
    pub fn from_template(template: &Template) -> Self {
        let hints = &template.driver_hints;
        match (hints.poll.command_interval_ms, hints.write.throttle_ms) {
            (Some(interval), _) => Self::Cadence(Duration::from_millis(interval)),
            (None, 0) => Self::Immediate,
            (None, throttle) => Self::Throttled(Duration::from_millis(throttle)),
        }
    }

    pub fn is_queued(self) -> bool {
        !matches!(self, Self::Immediate)
    }
}

// ============================================================================
// Device state shared by the background tasks
// ============================================================================

struct DeviceInner {
    id: String,
    template: Arc<Template>,
    driver: tokio::sync::Mutex<Box<dyn Driver>>,
    state: Mutex<ScheduleState>,
    queue: Mutex<WriteQueue>,
    /// Last known device-native values, normalized
    values: Mutex<ValueMap>,
    aliases: AliasSet,
    published_aliases: Mutex<HashMap<String, Value>>,
    store: SharedStore,
    logger: DeviceLogger,
    mode: WriteMode,
    /// Fast subset when the template defines a slow tier
    fast_ids: Option<Vec<String>>,
}

/// Make sure the driver has a link before an operation
async fn ensure_connected(driver: &mut dyn Driver) -> Result<()> {
    if !driver.is_connected() {
        driver.connect().await?;
    }
    Ok(())
}

impl DeviceInner {
    fn datapoint(&self, dp_id: &str) -> Result<&DatapointDef> {
        self.template
            .datapoint(dp_id)
            .ok_or_else(|| GatewayError::datapoint_not_found(dp_id))
    }

    // ------------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------------

    async fn announce(&self, display_name: &str) -> Result<()> {
        for dp in &self.template.datapoints {
            let meta = ObjectMeta {
                name: dp.display_name().to_string(),
                kind: dp.kind,
                unit: dp.unit.clone(),
                role: dp.role.clone(),
                readable: dp.is_readable(),
                writable: dp.is_writable(),
            };
            self.store
                .ensure_object(&datapoint_path(&self.id, &dp.id), meta)
                .await?;
        }
        for alias in self.aliases.iter() {
            let meta = ObjectMeta {
                name: alias.path.clone(),
                kind: alias.kind,
                unit: alias.unit.clone(),
                role: None,
                readable: true,
                writable: alias.writable,
            };
            self.store
                .ensure_object(&alias_path(&self.id, &alias.path), meta)
                .await?;
        }

        let connected = info_path(&self.id, INFO_CONNECTED);
        let last_error = info_path(&self.id, INFO_LAST_ERROR);
        self.store
            .ensure_object(
                &connected,
                ObjectMeta::read_only(format!("{} connected", display_name), ValueKind::Boolean),
            )
            .await?;
        self.store
            .ensure_object(
                &last_error,
                ObjectMeta::read_only(format!("{} last error", display_name), ValueKind::String),
            )
            .await?;
        self.store.set_state(&connected, Value::Bool(false), true).await?;
        self.store
            .set_state(&last_error, Value::Text(String::new()), true)
            .await?;

        self.store.subscribe(&device_prefix(&self.id)).await
    }

    async fn publish(&self, path: &str, value: Value) {
        if let Err(e) = self.store.set_state(path, value, true).await {
            self.logger.log_error("store", &e.to_string());
        }
    }

    async fn publish_values(&self, values: ValueMap) {
        let normalized: Vec<(String, Value)> = values
            .into_iter()
            .filter_map(|(id, value)| {
                let dp = self.template.datapoint(&id)?;
                Some((id, dp.normalize(&value)))
            })
            .collect();
        {
            let mut cache = self.values.lock();
            for (id, value) in &normalized {
                cache.insert(id.clone(), value.clone());
            }
        }
        for (id, value) in normalized {
            self.publish(&datapoint_path(&self.id, &id), value).await;
        }
    }

    /// Publish aliases whose value changed since the last publication
    async fn refresh_aliases(&self) {
        if self.aliases.is_empty() {
            return;
        }
        let ctx = AliasContext {
            connected: self.state.lock().connected,
        };
        let changed: Vec<(String, Value)> = {
            let values = self.values.lock();
            let mut published = self.published_aliases.lock();
            let mut changed = Vec::new();
            for (path, value) in self.aliases.compute(&values, &ctx) {
                if published.get(path) != Some(&value) {
                    published.insert(path.to_string(), value.clone());
                    changed.push((path.to_string(), value));
                }
            }
            changed
        };
        for (path, value) in changed {
            self.publish(&alias_path(&self.id, &path), value).await;
        }
    }

    async fn mark_connected(&self) {
        let (came_online, had_error) = {
            let mut state = self.state.lock();
            let came_online = !state.connected;
            state.connected = true;
            (came_online, state.last_error.take().is_some())
        };
        if came_online {
            self.logger.log_status(true, "device responded");
            self.logger.reset_errors();
            self.publish(&info_path(&self.id, INFO_CONNECTED), Value::Bool(true))
                .await;
        }
        if had_error {
            self.publish(
                &info_path(&self.id, INFO_LAST_ERROR),
                Value::Text(String::new()),
            )
            .await;
        }
    }

    async fn set_last_error(&self, operation: &str, message: String) {
        self.logger.log_error(operation, &message);
        let changed = {
            let mut state = self.state.lock();
            let changed = state.last_error.as_deref() != Some(message.as_str());
            state.last_error = Some(message.clone());
            changed
        };
        if changed {
            self.publish(&info_path(&self.id, INFO_LAST_ERROR), Value::Text(message))
                .await;
        }
    }

    /// A driver operation failed: the device counts as offline until the
    /// next success
    async fn on_device_error(&self, operation: &str, err: &GatewayError) {
        let went_offline = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.connected, false)
        };
        self.set_last_error(operation, err.to_string()).await;
        if went_offline {
            self.logger.log_status(false, err.kind());
            self.publish(&info_path(&self.id, INFO_CONNECTED), Value::Bool(false))
                .await;
            self.refresh_aliases().await;
        }
    }

    // ------------------------------------------------------------------------
    // Driver operations
    // ------------------------------------------------------------------------

    async fn read_from_device(&self, datapoints: &[&DatapointDef]) -> Result<ValueMap> {
        let mut driver = self.driver.lock().await;
        let result = match ensure_connected(&mut **driver).await {
            Ok(()) => driver.read_datapoints(datapoints).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.needs_disconnect() {
                driver.disconnect().await;
            }
        }
        result
    }

    async fn write_to_device(&self, dp_id: &str, value: &Value) -> Result<()> {
        let datapoint = self.datapoint(dp_id)?;
        let mut driver = self.driver.lock().await;
        let result = match ensure_connected(&mut **driver).await {
            Ok(()) => driver.write_datapoint(datapoint, value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.needs_disconnect() {
                driver.disconnect().await;
            }
        }
        result
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    async fn poll(&self, kind: PollKind) {
        let datapoints: Vec<&DatapointDef> = match (&self.fast_ids, kind) {
            (Some(fast), PollKind::Fast) => self
                .template
                .readable()
                .filter(|dp| fast.contains(&dp.id))
                .collect(),
            _ => self.template.readable().collect(),
        };

        let result = self.read_from_device(&datapoints).await;
        self.state.lock().timer.complete(kind, Instant::now());

        match result {
            Ok(values) => {
                debug!("[{}] {:?} poll: {} values", self.id, kind, values.len());
                self.publish_values(values).await;
                self.mark_connected().await;
                self.refresh_aliases().await;
            },
            Err(e) => self.on_device_error("poll", &e).await,
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Refresh a data point with a value that just reached the device
    async fn echo(&self, dp_id: &str, value: &Value) {
        let Some(dp) = self.template.datapoint(dp_id) else {
            return;
        };
        let normalized = dp.normalize(value);
        self.values
            .lock()
            .insert(dp_id.to_string(), normalized.clone());
        self.publish(&datapoint_path(&self.id, dp_id), normalized).await;
    }

    async fn confirm(&self, dp_id: &str, value: &Value, acks: Vec<AckTarget>) {
        for ack in acks {
            self.publish(&ack.path, ack.value).await;
        }
        self.echo(dp_id, value).await;
        self.refresh_aliases().await;
    }

    /// Resolve an inbound write to (data point, device value, ack locations)
    fn resolve_write(&self, target: DeviceTarget, value: Value) -> Result<(String, Value, AckTarget)> {
        match target {
            DeviceTarget::Datapoint(dp_id) => {
                let dp = self.datapoint(&dp_id)?;
                if !dp.is_writable() {
                    return Err(GatewayError::unsupported(format!(
                        "Data point '{}' is read-only",
                        dp_id
                    )));
                }
                let ack = AckTarget::new(datapoint_path(&self.id, &dp_id), value.clone());
                Ok((dp_id, value, ack))
            },
            DeviceTarget::Alias(path) => {
                let alias = self.aliases.get(&path).ok_or_else(|| {
                    GatewayError::config(format!("Unknown alias '{}'", path))
                })?;
                let (dp_id, device_value) = alias.to_device(&value)?;
                let ack = AckTarget::new(alias_path(&self.id, &path), value);
                Ok((dp_id, device_value, ack))
            },
            DeviceTarget::Info(key) => Err(GatewayError::unsupported(format!(
                "info.{} is maintained by the gateway",
                key
            ))),
        }
    }

    async fn write(&self, dp_id: &str, value: Value, acks: Vec<AckTarget>) -> Result<()> {
        let now = Instant::now();
        let rule = self.template.driver_hints.pre_write_rule(dp_id);
        let fire = {
            let mut state = self.state.lock();
            state.record_write(dp_id, now);
            rule.is_some_and(|rule| state.pre_writes.should_fire(rule, now))
        };
        let pre_writes = rule.filter(|_| fire);

        if self.mode.is_queued() {
            let coalesced = {
                let mut queue = self.queue.lock();
                if let Some(rule) = pre_writes {
                    for aux in &rule.writes {
                        queue.enqueue(WriteEntry::new(&aux.id, aux.value.clone()).guarding(dp_id));
                    }
                }
                queue.enqueue(WriteEntry::new(dp_id, value).with_acks(acks))
            };
            // The cooldown starts once an auxiliary reaches the device, see `drain`
            self.logger
                .log_write(dp_id, if coalesced { "coalesced" } else { "queued" });
            return Ok(());
        }

        if let Some(rule) = pre_writes {
            for aux in &rule.writes {
                self.logger
                    .log_write(&aux.id, &format!("pre-write {} before {}", aux.value, dp_id));
                if let Err(e) = self.write_to_device(&aux.id, &aux.value).await {
                    self.on_device_error("pre-write", &e).await;
                    return Err(e);
                }
                self.echo(&aux.id, &aux.value).await;
            }
            self.state.lock().pre_writes.mark_fired(dp_id, now);
        }

        match self.write_to_device(dp_id, &value).await {
            Ok(()) => {
                self.logger.log_write(dp_id, &format!("= {}", value));
                self.mark_connected().await;
                self.confirm(dp_id, &value, acks).await;
                Ok(())
            },
            Err(e) => {
                self.on_device_error("write", &e).await;
                Err(e)
            },
        }
    }

    /// Send up to `max` queued writes; stops at the first failure
    async fn drain(&self, max: usize) {
        for _ in 0..max {
            let Some(entry) = self.queue.lock().pop_next() else {
                break;
            };
            match self.write_to_device(&entry.dp_id, &entry.value).await {
                Ok(()) => {
                    self.logger.log_write(&entry.dp_id, &format!("= {}", entry.value));
                    self.mark_connected().await;
                    let WriteEntry {
                        dp_id,
                        value,
                        acks,
                        guards,
                        ..
                    } = entry;
                    if !guards.is_empty() {
                        let now = Instant::now();
                        let mut state = self.state.lock();
                        for trigger in &guards {
                            state.pre_writes.mark_fired(trigger, now);
                        }
                    }
                    self.confirm(&dp_id, &value, acks).await;
                },
                Err(e) => {
                    self.on_device_error("write", &e).await;
                    let outcome = self.queue.lock().requeue(entry);
                    match outcome {
                        Requeue::Retrying(attempts) => {
                            debug!("[{}] write retry {} queued", self.id, attempts);
                        },
                        Requeue::Superseded => {},
                        Requeue::Dropped { entry, guarded } => {
                            self.on_dropped(&entry, &guarded).await;
                        },
                    }
                    break;
                },
            }
        }
    }

    /// A queued write gave up after its last attempt
    async fn on_dropped(&self, entry: &WriteEntry, guarded: &[WriteEntry]) {
        let mut message = format!(
            "Write to '{}' dropped after {} attempts",
            entry.dp_id, entry.attempts
        );
        for primary in guarded {
            message.push_str(&format!(", '{}' dropped with it", primary.dp_id));
        }

        let fail_safe_target = self
            .template
            .driver_hints
            .watchdog
            .as_ref()
            .and_then(|w| w.fail_safe.as_ref())
            .map(|fs| fs.target.as_str());
        {
            let mut state = self.state.lock();
            // A failed precondition must run again before its primary goes out
            for trigger in &entry.guards {
                state.pre_writes.forget(trigger);
            }
            let disable_lost = std::iter::once(entry)
                .chain(guarded)
                .any(|e| Some(e.dp_id.as_str()) == fail_safe_target);
            if disable_lost {
                if let Some(watchdog) = state.watchdog.as_mut() {
                    watchdog.fail_safe.rearm();
                }
            }
        }

        self.set_last_error("write", message).await;
    }

    /// Write not originating from a user (watchdog, fail-safe).
    ///
    /// Returns whether the value was sent or queued.
    async fn internal_write(&self, dp_id: &str, value: Value) -> bool {
        if self.mode.is_queued() {
            self.queue
                .lock()
                .enqueue(WriteEntry::new(dp_id, value).prioritized());
            return true;
        }
        match self.write_to_device(dp_id, &value).await {
            Ok(()) => {
                self.echo(dp_id, &value).await;
                self.refresh_aliases().await;
                true
            },
            Err(e) => {
                self.on_device_error("watchdog", &e).await;
                false
            },
        }
    }

    async fn watchdog_tick(&self, hints: &WatchdogHints) {
        let now = Instant::now();
        let (value, targets, fail_safe_due) = {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            let targets: Vec<String> = active_targets(hints, &state.last_writes, now)
                .into_iter()
                .map(str::to_string)
                .collect();
            let last_trigger = hints
                .fail_safe
                .as_ref()
                .and_then(|fs| state.last_write_of(&fs.triggers));
            let Some(watchdog) = state.watchdog.as_mut() else {
                return;
            };
            // The ramp only advances while some target is active
            let value = (!targets.is_empty()).then(|| watchdog.ramp.next_value());
            let fail_safe_due = hints.fail_safe.as_ref().is_some_and(|fs| {
                watchdog.fail_safe.evaluate(
                    now,
                    last_trigger,
                    Duration::from_millis(fs.silence_ms),
                )
            });
            (value, targets, fail_safe_due)
        };

        if let Some(value) = value {
            for target in &targets {
                self.internal_write(target, Value::Int(value)).await;
            }
        }

        if let Some(fail_safe) = hints.fail_safe.as_ref().filter(|_| fail_safe_due) {
            self.logger.log_warn(&format!(
                "No write to {:?} for {} ms, fail-safe sets '{}' = {}",
                fail_safe.triggers, fail_safe.silence_ms, fail_safe.target, fail_safe.value
            ));
            if !self
                .internal_write(&fail_safe.target, fail_safe.value.clone())
                .await
            {
                if let Some(watchdog) = self.state.lock().watchdog.as_mut() {
                    watchdog.fail_safe.rearm();
                }
            }
        }
    }
}

// ============================================================================
// Background tasks
// ============================================================================

fn spawn_poll_loop(inner: Arc<DeviceInner>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = inner.state.lock().timer.next_due();
            tokio::select! {
                () = tokio::time::sleep_until(next) => {}
                () = token.cancelled() => break,
            }
            let due = inner.state.lock().timer.due(Instant::now());
            if let Some(kind) = due {
                tokio::select! {
                    () = inner.poll(kind) => {}
                    () = token.cancelled() => break,
                }
            }
        }
        debug!("[{}] poll loop stopped", inner.id);
    })
}

fn spawn_drain_loop(inner: Arc<DeviceInner>, token: CancellationToken, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_per_tick = inner.template.driver_hints.write.max_per_tick;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = token.cancelled() => break,
            }
            tokio::select! {
                () = inner.drain(max_per_tick) => {}
                () = token.cancelled() => break,
            }
        }
        debug!("[{}] write drain loop stopped", inner.id);
    })
}

fn spawn_cadence_loop(inner: Arc<DeviceInner>, token: CancellationToken, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = token.cancelled() => break,
            }
            let due = inner.state.lock().timer.due(Instant::now());
            let command = async {
                match due {
                    Some(kind) => inner.poll(kind).await,
                    None => inner.drain(1).await,
                }
            };
            tokio::select! {
                () = command => {}
                () = token.cancelled() => break,
            }
        }
        debug!("[{}] command loop stopped", inner.id);
    })
}

fn spawn_watchdog_loop(
    inner: Arc<DeviceInner>,
    token: CancellationToken,
    hints: WatchdogHints,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(hints.initial_delay()) => {}
            () = token.cancelled() => return,
        }
        let mut interval = tokio::time::interval(hints.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = token.cancelled() => break,
            }
            tokio::select! {
                () = inner.watchdog_tick(&hints) => {}
                () = token.cancelled() => break,
            }
        }
        debug!("[{}] watchdog stopped", inner.id);
    })
}

// ============================================================================
// Public handle
// ============================================================================

/// A running device
pub struct DeviceRuntime {
    inner: Arc<DeviceInner>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    scale_factors: Arc<ScaleFactorRegistry>,
}

impl std::fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("id", &self.inner.id)
            .field("template", &self.inner.template.id)
            .field("mode", &self.inner.mode)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl DeviceRuntime {
    /// Create the driver through the protocol registry and start the device
    pub async fn start(
        device: &DeviceConfig,
        template: Arc<Template>,
        ctx: &RuntimeContext,
    ) -> Result<Self> {
        device.validate()?;
        let driver = ctx.protocols.create(device, template.clone(), ctx).await?;
        Self::start_with_driver(device, template, driver, ctx).await
    }

    /// Start the device with an already constructed driver
    pub async fn start_with_driver(
        device: &DeviceConfig,
        template: Arc<Template>,
        driver: Box<dyn Driver>,
        ctx: &RuntimeContext,
    ) -> Result<Self> {
        let hints = &template.driver_hints;
        let fast_interval = Duration::from_millis(
            device
                .poll_interval_ms
                .or(hints.poll.fast_interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        let (slow_interval, fast_ids) = if hints.has_slow_tier() {
            (
                hints.poll.slow_interval_ms.map(Duration::from_millis),
                Some(hints.poll.fast_ids.clone()),
            )
        } else {
            (None, None)
        };
        let mode = WriteMode::from_template(&template);
        let timer = PollTimer::new(fast_interval, slow_interval, Instant::now());
        let watchdog = hints.watchdog.as_ref().map(WatchdogState::new);

        let logger = DeviceLogger::new(&device.id, ctx.error_log_interval);
        logger.log_init(
            driver.protocol(),
            &format!(
                "template '{}', poll {} ms, writes {:?}",
                template.id,
                fast_interval.as_millis(),
                mode
            ),
        );

        let inner = Arc::new(DeviceInner {
            id: device.id.clone(),
            aliases: AliasSet::derive(&template, &ctx.alias_rules),
            template: template.clone(),
            driver: tokio::sync::Mutex::new(driver),
            state: Mutex::new(ScheduleState::new(timer, watchdog)),
            queue: Mutex::new(WriteQueue::new()),
            values: Mutex::new(ValueMap::new()),
            published_aliases: Mutex::new(HashMap::new()),
            store: ctx.store.clone(),
            logger,
            mode,
            fast_ids,
        });
        inner.announce(device.display_name()).await?;

        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        match mode {
            WriteMode::Immediate => {
                tasks.push(spawn_poll_loop(inner.clone(), token.clone()));
            },
            WriteMode::Throttled(period) => {
                tasks.push(spawn_poll_loop(inner.clone(), token.clone()));
                tasks.push(spawn_drain_loop(inner.clone(), token.clone(), period));
            },
            WriteMode::Cadence(period) => {
                tasks.push(spawn_cadence_loop(inner.clone(), token.clone(), period));
            },
        }
        if let Some(watchdog) = template.driver_hints.watchdog.clone() {
            tasks.push(spawn_watchdog_loop(inner.clone(), token.clone(), watchdog));
        }

        Ok(Self {
            inner,
            token,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
            scale_factors: ctx.scale_factors.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.inner.template
    }

    pub fn mode(&self) -> WriteMode {
        self.inner.mode
    }

    pub fn aliases(&self) -> &AliasSet {
        &self.inner.aliases
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// Last known value of a data point
    pub fn value(&self, dp_id: &str) -> Option<Value> {
        self.inner.values.lock().get(dp_id).cloned()
    }

    /// Pending queued writes in drain order of registration
    pub fn queued_writes(&self) -> Vec<String> {
        self.inner
            .queue
            .lock()
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Handle a user write addressed to this device.
    ///
    /// In queued modes `Ok` means accepted; the store location is
    /// acknowledged once the value reaches the device.
    pub async fn handle_write(&self, target: DeviceTarget, value: Value) -> Result<()> {
        if self.is_stopped() {
            return Err(GatewayError::unsupported(format!(
                "Device '{}' is stopped",
                self.inner.id
            )));
        }
        match self.inner.resolve_write(target, value) {
            Ok((dp_id, device_value, ack)) => {
                self.inner.write(&dp_id, device_value, vec![ack]).await
            },
            Err(e) => {
                self.inner.set_last_error("write", e.to_string()).await;
                Err(e)
            },
        }
    }

    /// Stop timers, drop queued writes and disconnect in the background.
    ///
    /// Calling it again is a no-op. Outside a Tokio runtime the disconnect
    /// is skipped; the driver closes its link when dropped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.inner.queue.lock().clear();
        self.tasks.lock().clear();
        self.scale_factors.remove(&self.inner.id);
        self.inner.state.lock().connected = false;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("[{}] stopped outside a runtime, disconnect skipped", self.inner.id);
            return;
        };
        let inner = self.inner.clone();
        handle.spawn(async move {
            inner.driver.lock().await.disconnect().await;
            inner
                .publish(&info_path(&inner.id, INFO_CONNECTED), Value::Bool(false))
                .await;
            inner.logger.log_status(false, "stopped");
        });
    }
}
