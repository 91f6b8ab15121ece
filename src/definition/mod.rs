//! Workflow definition model.
//!
//! A [`WorkflowDefinition`] is the immutable template a tenant registers:
//! tasks, dependencies, declared variables, and execution configuration.
//! Definitions are parsed from JSON or YAML via [`parse_definition`] and
//! validated by the graph builder before any execution is created.

mod parse;
mod schema;

pub use parse::{parse_definition, DefinitionFormat};
pub use schema::{
    ExecutionConfig, FailurePolicy, RetryPolicy, TaskDefinition, VariableSpec, VariableType,
    WorkflowDefinition,
};
