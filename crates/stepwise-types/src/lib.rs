//! Shared domain types for Stepwise.
//!
//! This crate contains the declarative workflow model the engine interprets:
//! definitions, steps, conditions, save specs, and poll query specs, plus the
//! error types shared between the engine traits and their implementations.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, thiserror.

pub mod definition;
pub mod error;
pub mod query;
