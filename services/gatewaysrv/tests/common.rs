//! Test Common Utilities
//!
//! A scripted in-memory driver that records every operation with the
//! (paused) clock time it started at.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use gatewaysrv::driver::Driver;
use gatewaysrv::template::{DatapointDef, Template};
use gatewaysrv::value::{Value, ValueMap};
use gatewaysrv::{GatewayError, Result};

/// Recorded driver operation
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect,
    Disconnect,
    Read(Vec<String>),
    Write(String, Value),
}

/// Shared view of a [`MockDriver`]
#[derive(Clone)]
pub struct MockHandle {
    start: Instant,
    log: Arc<Mutex<Vec<(u64, Op)>>>,
    memory: Arc<Mutex<ValueMap>>,
    read_latencies: Arc<Mutex<VecDeque<u64>>>,
    fail_reads: Arc<AtomicBool>,
    reject_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    write_latency: Arc<AtomicU64>,
}

impl MockHandle {
    pub fn set(&self, id: &str, value: impl Into<Value>) {
        self.memory.lock().insert(id.to_string(), value.into());
    }

    /// Latencies of the next reads, in order; later reads take no time
    pub fn queue_read_latencies(&self, latencies: &[u64]) {
        self.read_latencies.lock().extend(latencies.iter().copied());
    }

    /// Reads fail with a transport error while set
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Reads fail with a protocol error (device answered, request refused)
    pub fn reject_reads(&self, reject: bool) {
        self.reject_reads.store(reject, Ordering::SeqCst);
    }

    /// Every write takes this long before it completes or fails
    pub fn set_write_latency(&self, latency_ms: u64) {
        self.write_latency.store(latency_ms, Ordering::SeqCst);
    }

    /// Writes fail with a protocol error while set
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<(u64, Op)> {
        self.log.lock().clone()
    }

    pub fn read_times(&self) -> Vec<u64> {
        self.ops()
            .into_iter()
            .filter(|(_, op)| matches!(op, Op::Read(_)))
            .map(|(t, _)| t)
            .collect()
    }

    /// `(time, id, value)` of every attempted write
    pub fn writes(&self) -> Vec<(u64, String, Value)> {
        self.ops()
            .into_iter()
            .filter_map(|(t, op)| match op {
                Op::Write(id, value) => Some((t, id, value)),
                _ => None,
            })
            .collect()
    }

    pub fn writes_to(&self, id: &str) -> Vec<Value> {
        self.writes()
            .into_iter()
            .filter(|(_, dp, _)| dp == id)
            .map(|(_, _, value)| value)
            .collect()
    }

    pub fn count(&self, wanted: &Op) -> usize {
        self.ops().iter().filter(|(_, op)| op == wanted).count()
    }

    fn record(&self, op: Op) {
        let at = Instant::now().duration_since(self.start).as_millis() as u64;
        self.log.lock().push((at, op));
    }
}

pub struct MockDriver {
    handle: MockHandle,
    connected: bool,
}

impl MockDriver {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle {
            start: Instant::now(),
            log: Arc::default(),
            memory: Arc::default(),
            read_latencies: Arc::default(),
            fail_reads: Arc::default(),
            reject_reads: Arc::default(),
            fail_writes: Arc::default(),
            write_latency: Arc::default(),
        };
        (
            Self {
                handle: handle.clone(),
                connected: false,
            },
            handle,
        )
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn protocol(&self) -> &str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<()> {
        self.handle.record(Op::Connect);
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.handle.record(Op::Disconnect);
        self.connected = false;
    }

    async fn read_datapoints(&mut self, datapoints: &[&DatapointDef]) -> Result<ValueMap> {
        self.handle
            .record(Op::Read(datapoints.iter().map(|dp| dp.id.clone()).collect()));
        let latency = self.handle.read_latencies.lock().pop_front().unwrap_or(0);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.handle.fail_reads.load(Ordering::SeqCst) {
            return Err(GatewayError::timeout("mock read"));
        }
        if self.handle.reject_reads.load(Ordering::SeqCst) {
            return Err(GatewayError::protocol("mock read: illegal data address"));
        }
        let memory = self.handle.memory.lock();
        Ok(datapoints
            .iter()
            .filter_map(|dp| memory.get(&dp.id).map(|v| (dp.id.clone(), v.clone())))
            .collect())
    }

    async fn write_datapoint(&mut self, datapoint: &DatapointDef, value: &Value) -> Result<()> {
        self.handle
            .record(Op::Write(datapoint.id.clone(), value.clone()));
        let latency = self.handle.write_latency.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.handle.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::protocol("mock write rejected"));
        }
        self.handle.set(&datapoint.id, value.clone());
        Ok(())
    }
}

pub fn template(yaml: &str) -> Arc<Template> {
    Arc::new(Template::from_yaml(yaml).unwrap())
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Let spawned tasks catch up; moves the paused clock by 1 ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
