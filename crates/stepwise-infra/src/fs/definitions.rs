//! Directory-of-YAML definition store.
//!
//! Each workflow lives in its own `<id>.yaml` (or `.yml`) file under the
//! store's root directory. Files are read on every load so edits take
//! effect without a restart.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use stepwise_core::engine::definition::{DefinitionError, load_definition_file};
use stepwise_core::store::DefinitionStore;
use stepwise_types::definition::WorkflowDefinition;
use tracing::debug;

const EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Resolves definition ids to YAML files under a root directory.
#[derive(Clone)]
pub struct FsDefinitionStore {
    root: PathBuf,
}

impl FsDefinitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, definition_id: &str) -> Option<PathBuf> {
        // Ids map to file stems; path separators would escape the root.
        if definition_id.is_empty() || definition_id.contains(['/', '\\', '.']) {
            return None;
        }
        EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{definition_id}.{ext}")))
            .find(|candidate| candidate.is_file())
    }

    /// List every definition in the directory, sorted by id. Files that fail
    /// to parse are reported as errors alongside the ones that load.
    pub fn discover(&self) -> Result<Vec<Result<WorkflowDefinition, DefinitionError>>, std::io::Error> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext))
            })
            .collect();
        paths.sort();

        Ok(paths
            .iter()
            .map(|path| load_definition_file(path))
            .collect())
    }
}

impl DefinitionStore for FsDefinitionStore {
    fn load<'a>(
        &'a self,
        definition_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowDefinition, DefinitionError>> + Send + 'a>>
    {
        Box::pin(async move {
            let path = self
                .path_for(definition_id)
                .ok_or_else(|| DefinitionError::NotFound(definition_id.to_string()))?;
            debug!(definition_id, path = %path.display(), "loading workflow definition");
            load_definition_file(&path)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"
steps:
  - id: show
    action: ui_form
    template: checkout
"#;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, FsDefinitionStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).expect("write file");
        }
        let store = FsDefinitionStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_by_id_takes_stem() {
        let (_dir, store) = store_with(&[("checkout.yaml", FLOW)]);
        let definition = store.load("checkout").await.expect("load");
        assert_eq!(definition.id, "checkout");
        assert_eq!(definition.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_load_yml_extension() {
        let (_dir, store) = store_with(&[("refund.yml", FLOW)]);
        let definition = store.load("refund").await.expect("load");
        assert_eq!(definition.id, "refund");
    }

    #[tokio::test]
    async fn test_load_unknown_id_is_not_found() {
        let (_dir, store) = store_with(&[("checkout.yaml", FLOW)]);
        let err = store.load("missing").await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_load_rejects_path_traversal() {
        let (_dir, store) = store_with(&[("checkout.yaml", FLOW)]);
        let err = store.load("../checkout").await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_invalid_yaml_is_parse_error() {
        let (_dir, store) = store_with(&[("broken.yaml", "steps: [not a step]")]);
        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_discover_lists_sorted_and_reports_failures() {
        let (_dir, store) = store_with(&[
            ("beta.yaml", FLOW),
            ("alpha.yaml", FLOW),
            ("broken.yaml", "steps: []"),
            ("notes.txt", "ignored"),
        ]);

        let results = store.discover().expect("read dir");
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().id, "alpha");
        assert_eq!(results[1].as_ref().unwrap().id, "beta");
        assert!(results[2].is_err());
    }
}
