//! Coalescing write queue
//!
//! Used when a device's writes are throttled. There is at most one live entry
//! per data point: a newer write replaces the value in place, merges the
//! store locations to acknowledge and restarts the attempt count. Entries
//! drain in first-registered order, priority entries (pre-writes and
//! watchdog values) ahead of everything else.

use std::collections::{HashMap, VecDeque};

use crate::value::Value;

/// Failed entries are dropped after this many attempts
pub const MAX_WRITE_ATTEMPTS: u32 = 10;

/// A store location confirmed once the write reaches the device
#[derive(Debug, Clone, PartialEq)]
pub struct AckTarget {
    pub path: String,
    /// Value as the user wrote it (before alias or unit conversion)
    pub value: Value,
}

impl AckTarget {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// A pending device write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    pub dp_id: String,
    /// Device-native value
    pub value: Value,
    pub acks: Vec<AckTarget>,
    pub attempts: u32,
    pub priority: bool,
    /// Primary writes that must not go out if this entry is dropped
    pub guards: Vec<String>,
}

impl WriteEntry {
    pub fn new(dp_id: impl Into<String>, value: Value) -> Self {
        Self {
            dp_id: dp_id.into(),
            value,
            acks: Vec::new(),
            attempts: 0,
            priority: false,
            guards: Vec::new(),
        }
    }

    pub fn with_ack(mut self, ack: AckTarget) -> Self {
        self.acks.push(ack);
        self
    }

    pub fn with_acks(mut self, acks: Vec<AckTarget>) -> Self {
        self.acks = acks;
        self
    }

    /// Priority entry guarding the given primary write
    pub fn guarding(mut self, primary: impl Into<String>) -> Self {
        self.priority = true;
        self.guards.push(primary.into());
        self
    }

    pub fn prioritized(mut self) -> Self {
        self.priority = true;
        self
    }

    fn merge_acks(&mut self, acks: Vec<AckTarget>, replace: bool) {
        for ack in acks {
            match self.acks.iter_mut().find(|a| a.path == ack.path) {
                Some(existing) if replace => existing.value = ack.value,
                Some(_) => {},
                None => self.acks.push(ack),
            }
        }
    }
}

/// Outcome of handing a failed entry back to the queue
#[derive(Debug, PartialEq)]
pub enum Requeue {
    /// Back at the head of its class with the given attempt count
    Retrying(u32),
    /// A newer write for the same data point superseded it
    Superseded,
    /// Attempt limit reached; `guarded` are the primaries dropped with it
    Dropped {
        entry: WriteEntry,
        guarded: Vec<WriteEntry>,
    },
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    order: VecDeque<String>,
    entries: HashMap<String, WriteEntry>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or coalesce. Returns `true` when an existing entry was updated.
    pub fn enqueue(&mut self, entry: WriteEntry) -> bool {
        match self.entries.get_mut(&entry.dp_id) {
            Some(existing) => {
                existing.value = entry.value;
                existing.attempts = 0;
                existing.priority |= entry.priority;
                existing.merge_acks(entry.acks, true);
                for guard in entry.guards {
                    if !existing.guards.contains(&guard) {
                        existing.guards.push(guard);
                    }
                }
                true
            },
            None => {
                self.order.push_back(entry.dp_id.clone());
                self.entries.insert(entry.dp_id.clone(), entry);
                false
            },
        }
    }

    /// Remove the next entry to send: the oldest priority entry, else the oldest
    pub fn pop_next(&mut self) -> Option<WriteEntry> {
        let index = self
            .order
            .iter()
            .position(|id| self.entries.get(id).is_some_and(|e| e.priority))
            .or(if self.order.is_empty() { None } else { Some(0) })?;
        let id = self.order.remove(index)?;
        self.entries.remove(&id)
    }

    /// Return an entry whose write failed
    pub fn requeue(&mut self, mut entry: WriteEntry) -> Requeue {
        if let Some(newer) = self.entries.get_mut(&entry.dp_id) {
            newer.merge_acks(entry.acks, false);
            newer.priority |= entry.priority;
            return Requeue::Superseded;
        }

        entry.attempts += 1;
        if entry.attempts >= MAX_WRITE_ATTEMPTS {
            let guarded = entry
                .guards
                .iter()
                .filter_map(|id| self.remove(id))
                .collect();
            return Requeue::Dropped { entry, guarded };
        }

        let attempts = entry.attempts;
        self.order.push_front(entry.dp_id.clone());
        self.entries.insert(entry.dp_id.clone(), entry);
        Requeue::Retrying(attempts)
    }

    pub fn remove(&mut self, dp_id: &str) -> Option<WriteEntry> {
        let entry = self.entries.remove(dp_id)?;
        self.order.retain(|id| id != dp_id);
        Some(entry)
    }

    /// Pending data point ids in registration order
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
