//! Observability events
//!
//! Actions report what they are doing through an [`EventSink`]. Generating an
//! event never fails the caller and a sink must never call back into the
//! engine.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

pub const JOB: &str = "job";
pub const THREAD: &str = "thread";
pub const PROCESS: &str = "process";
pub const SUBJOB: &str = "subjob";
pub const BREAKPOINT: &str = "breakpoint";
pub const TESTCASE: &str = "testcase";
pub const TESTCASE_STATUS: &str = "testcasestatus";
pub const SIGNAL: &str = "signal";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub job_id: u64,
    pub event_type: String,
    pub properties: BTreeMap<String, String>,
    pub timestamp: DateTime<Local>,
}

impl Event {
    pub fn new(job_id: u64, event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            event_type: event_type.into(),
            properties: BTreeMap::new(),
            timestamp: Local::now(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

pub trait EventSink: Send + Sync {
    fn generate_event(&self, event: Event);
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn generate_event(&self, event: Event) {
        tracing::debug!(
            job_id = event.job_id,
            event_type = %event.event_type,
            properties = ?event.properties,
            "Event"
        );
    }
}

/// Keeps every event in memory, for tests and for summaries
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events of one type whose `status` property matches
    pub fn with_status(&self, event_type: &str, status: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type && event.get("status") == Some(status))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn generate_event(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
