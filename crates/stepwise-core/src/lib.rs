//! Workflow engine and collaborator traits for Stepwise.
//!
//! This crate defines the "ports" (collaborator traits) that the
//! infrastructure layer implements -- persistence gateway, HTTP dispatcher,
//! definition store -- plus the engine itself. It depends only on
//! `stepwise-types`; never on `stepwise-infra` or any database/HTTP crate.

pub mod engine;
pub mod gateway;
pub mod http;
pub mod observer;
pub mod render;
pub mod store;
