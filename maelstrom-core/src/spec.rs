//! YAML workflow DSL.
//!
//! A spec file describes one hierarchical machine:
//!
//! ```yaml
//! name: traffic-light
//! version: 1.0
//! machine:
//!   id: root
//!   initial: green
//!   states:
//!     green:
//!       on:
//!         next: { target: yellow, guard: "ctx.cars < 10", action: log_change }
//!     yellow:
//!       timeout: 5s
//!       on:
//!         next: { target: red }
//!     red:
//!       on:
//!         next: { target: green }
//! llm:
//!   provider: anthropic
//!   tool_policies: ["rate_limit:10/min"]
//! actions:
//!   log_change: "Record why the light changed"
//! guards:
//!   always: "true"
//! ```
//!
//! State and transition maps keep their declaration order, which is what makes
//! the "first child" default for compound states deterministic.

use crate::error::CoreError;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Top-level spec document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub machine: MachineNode,

    /// Machine-level LLM configuration fragment.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub llm: Value,

    /// Named actions: name -> string instruction or structured map.
    #[serde(default)]
    pub actions: BTreeMap<String, Value>,

    /// Named guards: name -> guard expression.
    #[serde(default)]
    pub guards: BTreeMap<String, String>,

    /// The whole document as JSON, used as the machine-level config fragment.
    #[serde(skip)]
    raw: Value,
}

/// The root of the state tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineNode {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub initial: String,

    #[serde(default, deserialize_with = "deserialize_ordered")]
    pub states: Vec<(String, StateNode)>,
}

/// A state, possibly compound or parallel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Explicit initial child for compound states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Declared timeout, e.g. `30s`. Validated but never scheduled. Bare
    /// numbers are kept as text so validation can reject them.
    #[serde(
        default,
        deserialize_with = "deserialize_timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<String>,

    #[serde(default)]
    pub parallel: bool,

    #[serde(default, deserialize_with = "deserialize_ordered")]
    pub on: Vec<(String, TransitionSpec)>,

    #[serde(default, deserialize_with = "deserialize_ordered")]
    pub states: Vec<(String, StateNode)>,
}

/// A transition declared under `on`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionSpec {
    #[serde(default)]
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
}

impl MachineSpec {
    /// Parses a spec from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        let mut spec: MachineSpec = serde_yaml::from_str(text)?;
        spec.raw = serde_yaml::from_str(text)?;
        Ok(spec)
    }

    /// Machine id (the root state path).
    pub fn id(&self) -> &str {
        &self.machine.id
    }

    /// Returns true if the spec describes a machine (has a root id).
    pub fn is_statechart(&self) -> bool {
        !self.machine.id.is_empty()
    }

    /// The whole document as a JSON value.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Looks up a top-level state by name.
    pub fn top_level_state(&self, name: &str) -> Option<&StateNode> {
        self.machine
            .states
            .iter()
            .find(|(id, _)| id == name)
            .map(|(_, node)| node)
    }
}

impl StateNode {
    /// Returns true if the state has children.
    pub fn is_compound(&self) -> bool {
        !self.states.is_empty()
    }

    /// Initial child name: explicit, else the first declared child.
    pub fn initial_child(&self) -> Option<&str> {
        match self.initial.as_deref() {
            Some(initial) if !initial.is_empty() => Some(initial),
            _ => self.states.first().map(|(id, _)| id.as_str()),
        }
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => String::new(),
        Some(serde_yaml::Value::String(s)) => s,
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
        Some(other) => {
            return Err(de::Error::custom(format!(
                "version must be a string or number, got {:?}",
                other
            )))
        }
    })
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            return Err(de::Error::custom(format!(
                "timeout must be a duration string, got {:?}",
                other
            )))
        }
    })
}

/// Deserializes a map into a `Vec` of entries, keeping document order.
/// A `null` map (e.g. `states:` with nothing after it) is empty.
fn deserialize_ordered<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for OrderedVisitor<T>
    where
        T: Deserialize<'de>,
    {
        type Value = Vec<(String, T)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries: Vec<(String, T)> = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, T>()? {
                if entries.iter().any(|(k, _)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_any(OrderedVisitor(PhantomData))
}
