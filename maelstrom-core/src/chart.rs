//! Hierarchical state-transition primitive.
//!
//! States live in an arena indexed by [`StateId`]; transitions store ids, not
//! names. A [`MachineBuilder`] declares states by dot-path (`root.a.b`), the
//! parent of a state being its path minus the last segment. [`Machine::build`]
//! freezes the graph, and a [`Runtime`] executes one event at a time against a
//! JSON context.
//!
//! Execution rules:
//! - entering a compound state enters its initial child, entering a parallel
//!   state enters every child;
//! - for each active leaf, transitions are looked up from the leaf outward and
//!   the first one whose guard passes is taken;
//! - a taken transition exits everything below its domain (the nearest
//!   compound ancestor of the source that contains the target), runs its
//!   action, then enters the path down to the target.

use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Instance context: a JSON object.
pub type Context = Map<String, Value>;

/// Index of a state in a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

/// Index of an event name in a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u32);

impl StateId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event delivered to a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub data: Value,
}

impl Event {
    pub fn new(id: EventId, data: Value) -> Self {
        Self { id, data }
    }
}

/// Predicate gating a transition.
pub trait Guard: Send + Sync {
    fn check(&self, ctx: &Context, event: &Value) -> bool;
}

/// Best-effort result of an action. Never aborts a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Skipped(String),
    Failed(String),
}

/// What an action can see and change while a transition is taken.
pub struct ActionScope<'a> {
    pub ctx: &'a mut Context,
    pub event: &'a Event,
    pub from: StateId,
    pub to: StateId,
    pub cancel: &'a CancellationToken,
}

/// Side effect run between exit and entry of a taken transition.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, scope: &mut ActionScope<'_>) -> Outcome;
}

/// A transition out of a state.
#[derive(Clone)]
pub struct Transition {
    pub event: EventId,
    pub target: StateId,
    guard: Option<Arc<dyn Guard>>,
    action: Option<Arc<dyn Action>>,
}

impl Transition {
    pub fn has_guard(&self) -> bool {
        self.guard.is_some()
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("event", &self.event)
            .field("target", &self.target)
            .field("guard", &self.guard.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

/// Shape of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound { initial: StateId },
    Parallel,
}

#[derive(Debug)]
struct StateNode {
    path: String,
    parent: Option<StateId>,
    children: Vec<StateId>,
    kind: StateKind,
    transitions: Vec<Transition>,
}

struct PendingTransition {
    from: String,
    event: EventId,
    to: String,
    guard: Option<Arc<dyn Guard>>,
    action: Option<Arc<dyn Action>>,
}

/// Declares states and transitions, then builds an immutable [`Machine`].
pub struct MachineBuilder {
    root: String,
    paths: Vec<String>,
    state_ids: HashMap<String, StateId>,
    compound: HashMap<String, String>,
    parallel: BTreeSet<String>,
    events: Vec<String>,
    event_ids: HashMap<String, EventId>,
    transitions: Vec<PendingTransition>,
}

impl MachineBuilder {
    /// Creates a builder whose root state has the given path.
    pub fn new(root: impl Into<String>) -> Self {
        let mut builder = Self {
            root: root.into(),
            paths: Vec::new(),
            state_ids: HashMap::new(),
            compound: HashMap::new(),
            parallel: BTreeSet::new(),
            events: Vec::new(),
            event_ids: HashMap::new(),
            transitions: Vec::new(),
        };
        let root = builder.root.clone();
        builder.declare_state(&root);
        builder
    }

    /// Declares a state. Declaring the same path twice returns the same id.
    pub fn declare_state(&mut self, path: &str) -> StateId {
        if let Some(id) = self.state_ids.get(path) {
            return *id;
        }
        let id = StateId(self.paths.len() as u32);
        self.paths.push(path.to_string());
        self.state_ids.insert(path.to_string(), id);
        id
    }

    /// Marks a state compound with the given initial child path.
    pub fn mark_compound(&mut self, path: &str, initial_child: &str) {
        self.compound
            .insert(path.to_string(), initial_child.to_string());
    }

    /// Marks a state parallel: entering it enters all children.
    pub fn mark_parallel(&mut self, path: &str) {
        self.parallel.insert(path.to_string());
    }

    /// Adds a transition. The event name gets an id on first use.
    pub fn add_transition(
        &mut self,
        from: &str,
        event: &str,
        to: &str,
        guard: Option<Arc<dyn Guard>>,
        action: Option<Arc<dyn Action>>,
    ) -> EventId {
        let event = self.intern_event(event);
        self.transitions.push(PendingTransition {
            from: from.to_string(),
            event,
            to: to.to_string(),
            guard,
            action,
        });
        event
    }

    pub fn state_id(&self, path: &str) -> Option<StateId> {
        self.state_ids.get(path).copied()
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_ids.get(name).copied()
    }

    fn intern_event(&mut self, name: &str) -> EventId {
        if let Some(id) = self.event_ids.get(name) {
            return *id;
        }
        let id = EventId(self.events.len() as u32);
        self.events.push(name.to_string());
        self.event_ids.insert(name.to_string(), id);
        id
    }

    fn parent_path<'p>(&self, path: &'p str) -> Option<&'p str> {
        if path == self.root {
            return None;
        }
        path.rfind('.').map(|i| &path[..i])
    }

    /// Validates the declarations and freezes them into a machine.
    pub fn build(self) -> Result<Machine, CoreError> {
        let mut nodes: Vec<StateNode> = Vec::with_capacity(self.paths.len());

        for path in &self.paths {
            let parent = if path == &self.root {
                None
            } else {
                if !path.starts_with(&format!("{}.", self.root)) {
                    return Err(CoreError::InvalidSpec {
                        reason: format!("state '{}' is outside root '{}'", path, self.root),
                    });
                }
                let parent_path = self.parent_path(path).unwrap_or(&self.root);
                match self.state_ids.get(parent_path) {
                    Some(id) => Some(*id),
                    None => {
                        return Err(CoreError::InvalidSpec {
                            reason: format!(
                                "parent '{}' of state '{}' is not declared",
                                parent_path, path
                            ),
                        })
                    }
                }
            };
            nodes.push(StateNode {
                path: path.clone(),
                parent,
                children: Vec::new(),
                kind: StateKind::Atomic,
                transitions: Vec::new(),
            });
        }

        for idx in 0..nodes.len() {
            if let Some(parent) = nodes[idx].parent {
                nodes[parent.index()].children.push(StateId(idx as u32));
            }
        }

        for idx in 0..nodes.len() {
            let path = nodes[idx].path.clone();
            let kind = if self.parallel.contains(&path) {
                if nodes[idx].children.is_empty() {
                    return Err(CoreError::InvalidSpec {
                        reason: format!("parallel state '{}' has no child states", path),
                    });
                }
                StateKind::Parallel
            } else if let Some(initial_path) = self.compound.get(&path) {
                let initial = self
                    .state_ids
                    .get(initial_path)
                    .copied()
                    .filter(|id| nodes[idx].children.contains(id))
                    .ok_or_else(|| CoreError::InvalidSpec {
                        reason: format!(
                            "initial state '{}' of '{}' is not one of its children",
                            initial_path, path
                        ),
                    })?;
                StateKind::Compound { initial }
            } else if let Some(first) = nodes[idx].children.first() {
                StateKind::Compound { initial: *first }
            } else {
                StateKind::Atomic
            };
            nodes[idx].kind = kind;
        }

        for pending in self.transitions {
            let from = self.state_ids.get(&pending.from).copied().ok_or_else(|| {
                CoreError::InvalidSpec {
                    reason: format!("transition source '{}' is not a declared state", pending.from),
                }
            })?;
            let target = self.state_ids.get(&pending.to).copied().ok_or_else(|| {
                CoreError::InvalidSpec {
                    reason: format!(
                        "transition '{}' from '{}' targets undeclared state '{}'",
                        self.events[pending.event.0 as usize], pending.from, pending.to
                    ),
                }
            })?;
            nodes[from.index()].transitions.push(Transition {
                event: pending.event,
                target,
                guard: pending.guard,
                action: pending.action,
            });
        }

        Ok(Machine {
            states: nodes,
            state_ids: self.state_ids,
            events: self.events,
            event_ids: self.event_ids,
        })
    }
}

/// Immutable state graph.
#[derive(Debug)]
pub struct Machine {
    states: Vec<StateNode>,
    state_ids: HashMap<String, StateId>,
    events: Vec<String>,
    event_ids: HashMap<String, EventId>,
}

impl Machine {
    pub fn root(&self) -> StateId {
        StateId(0)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn state_id(&self, path: &str) -> Option<StateId> {
        self.state_ids.get(path).copied()
    }

    pub fn state_path(&self, id: StateId) -> Option<&str> {
        self.states.get(id.index()).map(|s| s.path.as_str())
    }

    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.event_ids.get(name).copied()
    }

    pub fn event_name(&self, id: EventId) -> Option<&str> {
        self.events.get(id.0 as usize).map(String::as_str)
    }

    pub fn kind(&self, id: StateId) -> Option<StateKind> {
        self.states.get(id.index()).map(|s| s.kind)
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.states.get(id.index()).and_then(|s| s.parent)
    }

    pub fn transitions(&self, id: StateId) -> &[Transition] {
        self.states
            .get(id.index())
            .map(|s| s.transitions.as_slice())
            .unwrap_or(&[])
    }

    /// All (id, path) pairs in declaration order.
    pub fn states(&self) -> impl Iterator<Item = (StateId, &str)> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| (StateId(i as u32), s.path.as_str()))
    }

    /// All (id, name) event pairs in first-use order.
    pub fn events(&self) -> impl Iterator<Item = (EventId, &str)> {
        self.events
            .iter()
            .enumerate()
            .map(|(i, e)| (EventId(i as u32), e.as_str()))
    }

    fn node(&self, id: StateId) -> &StateNode {
        &self.states[id.index()]
    }

    /// Returns true if `ancestor` is a strict ancestor of `id`.
    fn is_proper_ancestor(&self, ancestor: StateId, id: StateId) -> bool {
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.node(p).parent;
        }
        false
    }

    fn ancestors_inclusive(&self, id: StateId) -> Vec<StateId> {
        let mut chain = vec![id];
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            chain.push(p);
            cur = self.node(p).parent;
        }
        chain
    }

    fn default_leaves(&self, id: StateId, out: &mut BTreeSet<StateId>) {
        match self.node(id).kind {
            StateKind::Atomic => {
                out.insert(id);
            }
            StateKind::Compound { initial } => self.default_leaves(initial, out),
            StateKind::Parallel => {
                for child in &self.node(id).children {
                    self.default_leaves(*child, out);
                }
            }
        }
    }

    fn transition_domain(&self, source: StateId, target: StateId) -> StateId {
        let mut cur = self.node(source).parent;
        while let Some(p) = cur {
            let compound = !matches!(self.node(p).kind, StateKind::Parallel);
            if compound && self.is_proper_ancestor(p, target) {
                return p;
            }
            cur = self.node(p).parent;
        }
        self.root()
    }

    fn common_ancestor(&self, leaves: &BTreeSet<StateId>) -> Option<StateId> {
        let mut iter = leaves.iter();
        let first = *iter.next()?;
        let mut chain = self.ancestors_inclusive(first);
        for leaf in iter {
            let other = self.ancestors_inclusive(*leaf);
            chain.retain(|s| other.contains(s));
        }
        chain.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Stopped,
}

/// A machine bound to a context, accepting one event at a time.
pub struct Runtime {
    machine: Arc<Machine>,
    ctx: Context,
    active: BTreeSet<StateId>,
    status: Status,
}

impl Runtime {
    pub fn new(machine: Arc<Machine>, initial_ctx: Option<Context>) -> Self {
        Self {
            machine,
            ctx: initial_ctx.unwrap_or_default(),
            active: BTreeSet::new(),
            status: Status::Idle,
        }
    }

    /// Enters the root state. Starting a running runtime is a no-op.
    pub fn start(&mut self) -> Result<(), CoreError> {
        match self.status {
            Status::Stopped => Err(CoreError::Stopped),
            Status::Running => Ok(()),
            Status::Idle => {
                let root = self.machine.root();
                self.machine.default_leaves(root, &mut self.active);
                self.status = Status::Running;
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    /// Processes one event. Returns whether any transition was taken.
    pub async fn process_event(
        &mut self,
        event: Event,
        cancel: &CancellationToken,
    ) -> Result<bool, CoreError> {
        match self.status {
            Status::Idle => return Err(CoreError::NotStarted),
            Status::Stopped => return Err(CoreError::Stopped),
            Status::Running => {}
        }

        let machine = Arc::clone(&self.machine);
        let snapshot: Vec<StateId> = self.active.iter().copied().collect();
        let mut exited: BTreeSet<StateId> = BTreeSet::new();
        let mut taken = false;

        for leaf in snapshot {
            if exited.contains(&leaf) {
                continue;
            }
            let Some((source, transition)) = self.select(&machine, leaf, &event) else {
                continue;
            };

            let domain = machine.transition_domain(source, transition.target);
            let leaving: Vec<StateId> = self
                .active
                .iter()
                .copied()
                .filter(|s| domain == machine.root() || machine.is_proper_ancestor(domain, *s))
                .collect();
            for s in leaving {
                self.active.remove(&s);
                exited.insert(s);
            }

            if let Some(action) = transition.action.as_ref() {
                let mut scope = ActionScope {
                    ctx: &mut self.ctx,
                    event: &event,
                    from: source,
                    to: transition.target,
                    cancel,
                };
                match action.run(&mut scope).await {
                    Outcome::Applied => {}
                    Outcome::Skipped(reason) => {
                        tracing::debug!("Action skipped on {}: {}", source, reason)
                    }
                    Outcome::Failed(reason) => {
                        tracing::warn!("Action failed on {}: {}", source, reason)
                    }
                }
            }

            self.enter(&machine, domain, transition.target);
            taken = true;
        }

        Ok(taken)
    }

    fn select(&self, machine: &Machine, leaf: StateId, event: &Event) -> Option<(StateId, Transition)> {
        let mut cur = Some(leaf);
        while let Some(state) = cur {
            for t in machine.transitions(state) {
                if t.event != event.id {
                    continue;
                }
                let passes = t
                    .guard
                    .as_ref()
                    .map(|g| g.check(&self.ctx, &event.data))
                    .unwrap_or(true);
                if passes {
                    return Some((state, t.clone()));
                }
            }
            cur = machine.parent(state);
        }
        None
    }

    fn enter(&mut self, machine: &Machine, domain: StateId, target: StateId) {
        let mut chain = machine.ancestors_inclusive(target);
        if let Some(pos) = chain.iter().position(|s| *s == domain) {
            chain.truncate(pos);
        }
        chain.reverse();

        for state in &chain {
            let Some(parent) = machine.parent(*state) else {
                continue;
            };
            if machine.kind(parent) == Some(StateKind::Parallel) {
                for sibling in &machine.node(parent).children {
                    if sibling != state {
                        machine.default_leaves(*sibling, &mut self.active);
                    }
                }
            }
        }
        machine.default_leaves(target, &mut self.active);
    }

    /// The single active leaf, or the nearest common ancestor of the active
    /// leaves when parallel regions are active.
    pub fn current_state(&self) -> Option<StateId> {
        self.machine.common_ancestor(&self.active)
    }

    pub fn active_leaves(&self) -> impl Iterator<Item = StateId> + '_ {
        self.active.iter().copied()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Stops the runtime. Further events are rejected. Stopping twice is a
    /// no-op; a runtime that never started has nothing to stop.
    pub fn stop(&mut self) -> Result<(), CoreError> {
        if self.status == Status::Idle {
            return Err(CoreError::NotStarted);
        }
        self.status = Status::Stopped;
        self.active.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CtxFlag(&'static str);

    impl Guard for CtxFlag {
        fn check(&self, ctx: &Context, _event: &Value) -> bool {
            ctx.get(self.0).and_then(Value::as_bool).unwrap_or(false)
        }
    }

    struct Count(&'static str);

    #[async_trait]
    impl Action for Count {
        async fn run(&self, scope: &mut ActionScope<'_>) -> Outcome {
            let n = scope.ctx.get(self.0).and_then(Value::as_i64).unwrap_or(0);
            scope.ctx.insert(self.0.to_string(), json!(n + 1));
            Outcome::Applied
        }
    }

    fn path_of(rt: &Runtime) -> String {
        let id = rt.current_state().unwrap();
        rt.machine().state_path(id).unwrap().to_string()
    }

    fn event(machine: &Machine, name: &str) -> Event {
        Event::new(machine.event_id(name).unwrap(), Value::Null)
    }

    fn light() -> Arc<Machine> {
        let mut b = MachineBuilder::new("root");
        for s in ["root.green", "root.yellow", "root.red"] {
            b.declare_state(s);
        }
        b.mark_compound("root", "root.green");
        b.add_transition("root.green", "timer", "root.yellow", None, None);
        b.add_transition("root.yellow", "timer", "root.red", None, None);
        b.add_transition("root.red", "timer", "root.green", None, None);
        Arc::new(b.build().unwrap())
    }

    #[tokio::test]
    async fn test_flat_cycle() {
        let machine = light();
        let mut rt = Runtime::new(machine.clone(), None);
        rt.start().unwrap();
        assert_eq!(path_of(&rt), "root.green");

        let cancel = CancellationToken::new();
        assert!(rt.process_event(event(&machine, "timer"), &cancel).await.unwrap());
        assert_eq!(path_of(&rt), "root.yellow");
        rt.process_event(event(&machine, "timer"), &cancel).await.unwrap();
        rt.process_event(event(&machine, "timer"), &cancel).await.unwrap();
        assert_eq!(path_of(&rt), "root.green");
    }

    #[tokio::test]
    async fn test_not_started_and_stopped() {
        let machine = light();
        let mut rt = Runtime::new(machine.clone(), None);
        let cancel = CancellationToken::new();
        assert!(matches!(
            rt.process_event(event(&machine, "timer"), &cancel).await,
            Err(CoreError::NotStarted)
        ));
        rt.start().unwrap();
        rt.stop().unwrap();
        assert!(matches!(
            rt.process_event(event(&machine, "timer"), &cancel).await,
            Err(CoreError::Stopped)
        ));
        assert!(rt.start().is_err());
    }

    #[test]
    fn test_stop_requires_start() {
        let machine = light();
        let mut rt = Runtime::new(machine, None);
        assert!(matches!(rt.stop(), Err(CoreError::NotStarted)));
        // The failed stop leaves the runtime startable.
        rt.start().unwrap();
        assert_eq!(path_of(&rt), "root.green");

        rt.stop().unwrap();
        assert_eq!(rt.active_leaves().count(), 0);
        rt.stop().unwrap();
        assert!(rt.start().is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let machine = light();
        let mut rt = Runtime::new(machine, None);
        rt.start().unwrap();
        let cancel = CancellationToken::new();
        let taken = rt
            .process_event(Event::new(EventId(99), Value::Null), &cancel)
            .await
            .unwrap();
        assert!(!taken);
        assert_eq!(path_of(&rt), "root.green");
    }

    #[tokio::test]
    async fn test_guard_and_action() {
        let mut b = MachineBuilder::new("m");
        b.declare_state("m.idle");
        b.declare_state("m.done");
        b.mark_compound("m", "m.idle");
        b.add_transition(
            "m.idle",
            "go",
            "m.done",
            Some(Arc::new(CtxFlag("ready"))),
            Some(Arc::new(Count("runs"))),
        );
        let machine = Arc::new(b.build().unwrap());
        let cancel = CancellationToken::new();

        let mut blocked = Runtime::new(machine.clone(), None);
        blocked.start().unwrap();
        assert!(!blocked.process_event(event(&machine, "go"), &cancel).await.unwrap());
        assert_eq!(path_of(&blocked), "m.idle");

        let mut ctx = Context::new();
        ctx.insert("ready".into(), json!(true));
        let mut rt = Runtime::new(machine.clone(), Some(ctx));
        rt.start().unwrap();
        assert!(rt.process_event(event(&machine, "go"), &cancel).await.unwrap());
        assert_eq!(path_of(&rt), "m.done");
        assert_eq!(rt.context()["runs"], json!(1));
    }

    #[tokio::test]
    async fn test_nested_initial_and_bubbling() {
        let mut b = MachineBuilder::new("r");
        for s in ["r.work", "r.work.a", "r.work.b", "r.halt"] {
            b.declare_state(s);
        }
        b.mark_compound("r", "r.work");
        b.mark_compound("r.work", "r.work.a");
        b.add_transition("r.work.a", "next", "r.work.b", None, None);
        // Defined on the parent, taken from any child.
        b.add_transition("r.work", "abort", "r.halt", None, None);
        let machine = Arc::new(b.build().unwrap());
        let cancel = CancellationToken::new();

        let mut rt = Runtime::new(machine.clone(), None);
        rt.start().unwrap();
        assert_eq!(path_of(&rt), "r.work.a");
        rt.process_event(event(&machine, "next"), &cancel).await.unwrap();
        assert_eq!(path_of(&rt), "r.work.b");
        rt.process_event(event(&machine, "abort"), &cancel).await.unwrap();
        assert_eq!(path_of(&rt), "r.halt");
    }

    #[tokio::test]
    async fn test_parallel_regions() {
        let mut b = MachineBuilder::new("r");
        for s in [
            "r.p",
            "r.p.left",
            "r.p.left.on",
            "r.p.left.off",
            "r.p.right",
            "r.p.right.x",
            "r.p.right.y",
            "r.end",
        ] {
            b.declare_state(s);
        }
        b.mark_compound("r", "r.p");
        b.mark_parallel("r.p");
        b.mark_compound("r.p.left", "r.p.left.on");
        b.mark_compound("r.p.right", "r.p.right.x");
        b.add_transition("r.p.left.on", "flip", "r.p.left.off", None, None);
        b.add_transition("r.p.right.x", "flip", "r.p.right.y", None, None);
        b.add_transition("r.p", "finish", "r.end", None, Some(Arc::new(Count("finished"))));
        let machine = Arc::new(b.build().unwrap());
        let cancel = CancellationToken::new();

        let mut rt = Runtime::new(machine.clone(), None);
        rt.start().unwrap();
        assert_eq!(rt.active_leaves().count(), 2);
        assert_eq!(path_of(&rt), "r.p");

        rt.process_event(event(&machine, "flip"), &cancel).await.unwrap();
        let leaves: Vec<&str> = rt
            .active_leaves()
            .map(|s| machine.state_path(s).unwrap())
            .collect();
        assert_eq!(leaves, vec!["r.p.left.off", "r.p.right.y"]);

        // Both leaves bubble to the same transition; it fires once.
        rt.process_event(event(&machine, "finish"), &cancel).await.unwrap();
        assert_eq!(path_of(&rt), "r.end");
        assert_eq!(rt.context()["finished"], json!(1));
    }

    #[tokio::test]
    async fn test_self_transition_reenters() {
        let mut b = MachineBuilder::new("r");
        b.declare_state("r.loop");
        b.mark_compound("r", "r.loop");
        b.add_transition("r.loop", "tick", "r.loop", None, Some(Arc::new(Count("ticks"))));
        let machine = Arc::new(b.build().unwrap());
        let cancel = CancellationToken::new();

        let mut rt = Runtime::new(machine.clone(), None);
        rt.start().unwrap();
        for _ in 0..3 {
            rt.process_event(event(&machine, "tick"), &cancel).await.unwrap();
        }
        assert_eq!(path_of(&rt), "r.loop");
        assert_eq!(rt.context()["ticks"], json!(3));
    }

    #[test]
    fn test_event_ids_are_interned() {
        let mut b = MachineBuilder::new("r");
        b.declare_state("r.a");
        b.declare_state("r.b");
        let first = b.add_transition("r.a", "go", "r.b", None, None);
        let second = b.add_transition("r.b", "go", "r.a", None, None);
        assert_eq!(first, second);
        assert_eq!(b.declare_state("r.a"), b.state_id("r.a").unwrap());
    }

    #[test]
    fn test_build_rejects_undeclared_target() {
        let mut b = MachineBuilder::new("r");
        b.declare_state("r.a");
        b.add_transition("r.a", "go", "r.missing", None, None);
        assert!(matches!(b.build(), Err(CoreError::InvalidSpec { .. })));
    }

    #[test]
    fn test_build_rejects_bad_initial() {
        let mut b = MachineBuilder::new("r");
        b.declare_state("r.a");
        b.declare_state("r.a.inner");
        b.mark_compound("r", "r.a.inner");
        assert!(matches!(b.build(), Err(CoreError::InvalidSpec { .. })));
    }

    #[test]
    fn test_build_rejects_orphan() {
        let mut b = MachineBuilder::new("r");
        b.declare_state("r.x.y");
        assert!(b.build().is_err());
    }
}
