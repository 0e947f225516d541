//! Definition store trait.
//!
//! The runner resolves a `definition_id` to a parsed, validated
//! `WorkflowDefinition` through this trait. The in-memory store here covers
//! embedding and tests; the directory-of-YAML store lives in
//! `stepwise-infra`.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;
use stepwise_types::definition::WorkflowDefinition;

use crate::engine::definition::{DefinitionError, validate};

/// Resolves definition ids for the runner.
pub trait DefinitionStore: Send + Sync {
    fn load<'a>(
        &'a self,
        definition_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowDefinition, DefinitionError>> + Send + 'a>>;
}

/// Keeps validated definitions in memory, keyed by their id.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition. Replaces any previous definition
    /// with the same id.
    pub fn insert(&self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        if definition.id.is_empty() {
            return Err(DefinitionError::Validation(
                "definition has no id".to_string(),
            ));
        }
        validate(&definition)?;
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn load<'a>(
        &'a self,
        definition_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowDefinition, DefinitionError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.definitions
                .get(definition_id)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| DefinitionError::NotFound(definition_id.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
