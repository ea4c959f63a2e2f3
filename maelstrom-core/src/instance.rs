//! Persisted instance record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One delivered event, as logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub data: Value,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Durable form of an instance: its initial context and the append-only log
/// of delivered events. Replaying the log from the initial context rebuilds
/// the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(rename = "initialContext", default)]
    pub initial_context: Value,

    #[serde(default)]
    pub history: Vec<EventRecord>,
}

impl InstanceRecord {
    /// Creates a record with an empty history.
    pub fn new(initial_context: Value) -> Self {
        Self {
            initial_context,
            history: Vec::new(),
        }
    }

    /// Appends a delivered event.
    pub fn append(&mut self, event: EventRecord) {
        self.history.push(event);
    }

    /// The initial context as an object. Anything else starts empty.
    pub fn context_object(&self) -> serde_json::Map<String, Value> {
        match &self.initial_context {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// Identifies an instance: machine id plus instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub machine_id: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(machine_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.instance_id)
    }
}
