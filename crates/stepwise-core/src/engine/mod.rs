//! Workflow engine core: expression evaluation, context threading, condition
//! resolution, and chain-driven step execution.
//!
//! This module contains the "brain" of the engine:
//! - `definition` -- YAML parsing, validation, filesystem load helpers
//! - `evaluator` -- minijinja-backed expression/interpolation evaluator
//! - `context` -- per-run key-value store with two-tier path lookup
//! - `condition` -- first-truthy-wins condition resolution
//! - `plugin` -- request body transform registry and built-in plugins
//! - `executor` -- one handler per step action kind
//! - `runner` -- entry point, bounded step chaining, cancellation

pub mod condition;
pub mod context;
pub mod definition;
pub mod evaluator;
pub mod executor;
pub mod plugin;
pub mod runner;
