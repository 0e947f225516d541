//! Filesystem-backed definition storage.

pub mod definitions;

pub use definitions::FsDefinitionStore;
