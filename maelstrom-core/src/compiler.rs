//! Machine compiler: YAML spec to executable state graph.
//!
//! Compilation runs two depth-first passes over the state tree. The declare
//! pass gives every state its full dot-path and marks compound and parallel
//! states. The configure pass validates timeouts, resolves transition targets
//! to absolute paths and binds guards and actions through [`Bindings`].

use crate::chart::{Action, Context, EventId, Guard, Machine, MachineBuilder, Runtime, StateId};
use crate::duration::parse_duration;
use crate::error::CoreError;
use crate::guard;
use crate::spec::{MachineSpec, StateNode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Turns guard text and raw action content into executable objects.
pub trait Bindings: Send + Sync {
    /// Resolves guard text. Defaults to inline expression, then named guard.
    fn resolve_guard(&self, spec: &MachineSpec, text: &str) -> Option<Arc<dyn Guard>> {
        guard::resolve_guard(text, &spec.guards)
    }

    /// Resolves raw action content. `None` leaves the transition without an action.
    fn resolve_action(&self, spec: &MachineSpec, raw: &Value) -> Option<Arc<dyn Action>>;
}

/// Binds guards only; actions are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct GuardOnly;

impl Bindings for GuardOnly {
    fn resolve_action(&self, _spec: &MachineSpec, _raw: &Value) -> Option<Arc<dyn Action>> {
        None
    }
}

/// A compiled machine with its id maps.
#[derive(Debug)]
pub struct CompiledMachine {
    spec: Arc<MachineSpec>,
    machine: Arc<Machine>,
    state_paths: HashMap<StateId, String>,
    state_ids: HashMap<String, StateId>,
    event_names: HashMap<EventId, String>,
    event_ids: HashMap<String, EventId>,
}

impl CompiledMachine {
    pub fn spec(&self) -> &Arc<MachineSpec> {
        &self.spec
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Machine id (root path).
    pub fn id(&self) -> &str {
        self.spec.id()
    }

    pub fn state_id(&self, path: &str) -> Option<StateId> {
        self.state_ids.get(path).copied()
    }

    pub fn state_path(&self, id: StateId) -> Option<&str> {
        self.state_paths.get(&id).map(String::as_str)
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_ids.get(name).copied()
    }

    pub fn event_name(&self, id: EventId) -> Option<&str> {
        self.event_names.get(&id).map(String::as_str)
    }

    /// Event names in first-use order.
    pub fn event_names(&self) -> Vec<&str> {
        self.machine.events().map(|(_, name)| name).collect()
    }

    /// Path of the leaf a fresh runtime starts in.
    pub fn initial_path(&self) -> Result<String, CoreError> {
        let mut rt = self.start(None)?;
        let path = self.current_path(&rt).unwrap_or_default().to_string();
        rt.stop()?;
        Ok(path)
    }

    /// Creates and starts a runtime bound to the given context.
    pub fn start(&self, ctx: Option<Context>) -> Result<Runtime, CoreError> {
        let mut rt = Runtime::new(Arc::clone(&self.machine), ctx);
        rt.start()?;
        Ok(rt)
    }

    /// Current state path of a runtime of this machine.
    pub fn current_path(&self, rt: &Runtime) -> Option<&str> {
        rt.current_state().and_then(|id| self.state_path(id))
    }
}

/// Compiles a spec into a machine.
pub fn compile(
    spec: Arc<MachineSpec>,
    bindings: &dyn Bindings,
) -> Result<CompiledMachine, CoreError> {
    let root = spec.machine.id.clone();
    if root.is_empty() {
        return Err(CoreError::InvalidSpec {
            reason: "machine.id is required".to_string(),
        });
    }
    let initial = spec.machine.initial.clone();
    if spec.top_level_state(&initial).is_none() {
        return Err(CoreError::InvalidSpec {
            reason: format!("initial state '{}' is not a top-level state", initial),
        });
    }

    let mut builder = MachineBuilder::new(root.clone());
    builder.mark_compound(&root, &format!("{}.{}", root, initial));

    declare(&mut builder, &root, &spec.machine.states);
    configure(&mut builder, &spec, bindings, &root, &root, &spec.machine.states)?;

    let machine = Arc::new(builder.build()?);

    let mut state_paths = HashMap::new();
    let mut state_ids = HashMap::new();
    for (id, path) in machine.states() {
        state_paths.insert(id, path.to_string());
        state_ids.insert(path.to_string(), id);
    }
    let mut event_names = HashMap::new();
    let mut event_ids = HashMap::new();
    for (id, name) in machine.events() {
        event_names.insert(id, name.to_string());
        event_ids.insert(name.to_string(), id);
    }

    tracing::debug!(
        "Compiled machine '{}': {} states, {} events",
        root,
        state_paths.len(),
        event_ids.len()
    );

    Ok(CompiledMachine {
        spec,
        machine,
        state_paths,
        state_ids,
        event_names,
        event_ids,
    })
}

fn declare(builder: &mut MachineBuilder, parent: &str, states: &[(String, StateNode)]) {
    for (name, node) in states {
        let path = format!("{}.{}", parent, name);
        builder.declare_state(&path);
        if node.parallel {
            builder.mark_parallel(&path);
        } else if let Some(initial) = node.initial_child() {
            builder.mark_compound(&path, &format!("{}.{}", path, initial));
        }
        declare(builder, &path, &node.states);
    }
}

fn configure(
    builder: &mut MachineBuilder,
    spec: &MachineSpec,
    bindings: &dyn Bindings,
    root: &str,
    parent: &str,
    states: &[(String, StateNode)],
) -> Result<(), CoreError> {
    for (name, node) in states {
        let path = format!("{}.{}", parent, name);

        if let Some(timeout) = node.timeout.as_deref() {
            parse_duration(timeout).map_err(|e| CoreError::InvalidTimeout {
                state: path.clone(),
                value: timeout.to_string(),
                reason: e.to_string(),
            })?;
            tracing::warn!(
                "State '{}' declares timeout {}; timeouts are not executed",
                path,
                timeout
            );
        }

        for (event, transition) in &node.on {
            if transition.target.is_empty() {
                return Err(CoreError::InvalidSpec {
                    reason: format!("transition '{}' on '{}' has no target", event, path),
                });
            }
            let target = resolve_target(root, parent, &path, &transition.target);
            let guard = transition
                .guard
                .as_deref()
                .and_then(|text| bindings.resolve_guard(spec, text));
            let action = transition
                .action
                .as_ref()
                .and_then(|raw| bindings.resolve_action(spec, raw));
            builder.add_transition(&path, event, &target, guard, action);
        }

        configure(builder, spec, bindings, root, &path, &node.states)?;
    }
    Ok(())
}

/// Absolute path of a transition target written inside `state`.
fn resolve_target(root: &str, parent: &str, state: &str, target: &str) -> String {
    if target.starts_with(&format!("{}.", root)) {
        target.to_string()
    } else if target.contains('.') {
        format!("{}.{}", root, target)
    } else if target == state {
        state.to_string()
    } else {
        format!("{}.{}", parent, target)
    }
}
