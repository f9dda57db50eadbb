//! Workflow definitions: YAML schema, validated graph, inputs, agents.
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowGraph (validated, phased)
//!                          │                      │
//!                   resolve_inputs()        Scheduler / BlockRunner
//!                                                 │
//!                  agents/specialists, teams ──► AgentLibrary
//! ```

pub mod graph;
pub mod inputs;
pub mod schema;
pub mod specialist;

pub use graph::{validate, WorkflowGraph};
pub use inputs::{resolve_inputs, ResolvedInputs};
pub use schema::{
    BlockSpec, CustomLogic, ElseTarget, InputField, LogicHooks, NextBranch, NextRule,
    ProviderSpec, WorkflowDefinition,
};
pub use specialist::{AgentLibrary, SpecialistDef};
