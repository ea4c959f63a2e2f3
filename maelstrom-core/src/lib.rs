//! # maelstrom-core
//!
//! Statechart core for maelstrom.
//!
//! This crate provides:
//! - The YAML workflow DSL
//! - A hierarchical/parallel state-transition primitive
//! - The machine compiler
//! - Guard expression evaluation
//! - The persisted instance record

pub mod chart;
pub mod compiler;
pub mod duration;
pub mod error;
pub mod guard;
pub mod instance;
pub mod spec;

pub use chart::{
    Action, ActionScope, Context, Event, EventId, Guard, Machine, MachineBuilder, Outcome,
    Runtime, StateId, StateKind,
};
pub use compiler::{compile, Bindings, CompiledMachine, GuardOnly};
pub use duration::{parse_duration, DurationError};
pub use error::CoreError;
pub use guard::{resolve_guard, CompiledGuard, GuardExpr};
pub use instance::{EventRecord, InstanceKey, InstanceRecord};
pub use spec::{MachineSpec, StateNode, TransitionSpec};
