//! Render backends for `ui_form` steps.
//!
//! A `ui_form` step delegates to a render backend keyed by its `render_type`.
//! Two built-ins are provided: the `"ui"` backend (default) shapes a
//! structured payload for a client-side renderer, and the `"template"`
//! backend renders a server-side minijinja template loaded from a directory.
//! An unknown `render_type` is fatal for the step.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use minijinja::{Environment, ErrorKind, Value as TemplateValue, path_loader};
use serde_json::{Value, json};

type JsonMap = serde_json::Map<String, Value>;

/// Render backend key used when a step carries no `render_type`.
pub const DEFAULT_RENDER_TYPE: &str = "ui";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unsupported render_type '{0}'")]
    UnknownBackend(String),

    #[error("template '{0}' not found")]
    MissingTemplate(String),

    #[error("render failed: {0}")]
    Render(String),
}

// ---------------------------------------------------------------------------
// Renderer trait and registry
// ---------------------------------------------------------------------------

/// The output of a render backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedView {
    /// Structured UI-payload transfer object for a client-side renderer.
    Payload(Value),
    /// Server-rendered document.
    Document(String),
}

/// One render backend.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, context: &JsonMap) -> Result<RenderedView, RenderError>;
}

/// Registry of render backends keyed by `render_type`.
#[derive(Default)]
pub struct RenderRegistry {
    backends: DashMap<String, Arc<dyn Renderer>>,
}

impl RenderRegistry {
    /// Registry with the `"ui"` payload backend installed.
    pub fn with_builtins() -> Self {
        let registry = Self::default();
        registry.register(DEFAULT_RENDER_TYPE, Arc::new(UiPayloadRenderer));
        registry
    }

    /// Registry with both built-ins, server templates loaded from `dir`.
    pub fn with_template_dir(dir: impl AsRef<Path>) -> Self {
        let registry = Self::with_builtins();
        registry.register("template", Arc::new(TemplateRenderer::new(dir)));
        registry
    }

    pub fn register(&self, render_type: impl Into<String>, backend: Arc<dyn Renderer>) {
        self.backends.insert(render_type.into(), backend);
    }

    /// Render through the backend `render_type` selects (default `"ui"`).
    pub fn render(
        &self,
        render_type: Option<&str>,
        template: &str,
        context: &JsonMap,
    ) -> Result<RenderedView, RenderError> {
        let key = render_type.unwrap_or(DEFAULT_RENDER_TYPE);
        let backend = self
            .backends
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RenderError::UnknownBackend(key.to_string()))?;
        backend.render(template, context)
    }
}

// ---------------------------------------------------------------------------
// Built-in: "ui" payload backend
// ---------------------------------------------------------------------------

/// Shapes the template name and context into a transfer object; the actual
/// widget rendering happens client-side.
pub struct UiPayloadRenderer;

impl Renderer for UiPayloadRenderer {
    fn render(&self, template: &str, context: &JsonMap) -> Result<RenderedView, RenderError> {
        Ok(RenderedView::Payload(json!({
            "render": "ui",
            "template": template,
            "context": context,
        })))
    }
}

// ---------------------------------------------------------------------------
// Built-in: "template" server-rendered backend
// ---------------------------------------------------------------------------

/// Renders minijinja templates from a directory. The step's `template` field
/// is the file name relative to the directory (e.g. `receipt.html`).
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(dir.as_ref()));
        Self { env }
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template: &str, context: &JsonMap) -> Result<RenderedView, RenderError> {
        let tmpl = self.env.get_template(template).map_err(|err| {
            if err.kind() == ErrorKind::TemplateNotFound {
                RenderError::MissingTemplate(template.to_string())
            } else {
                RenderError::Render(err.to_string())
            }
        })?;
        let rendered = tmpl
            .render(TemplateValue::from_serialize(context))
            .map_err(|err| RenderError::Render(err.to_string()))?;
        Ok(RenderedView::Document(rendered))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
