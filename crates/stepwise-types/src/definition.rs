//! Workflow definition types for Stepwise.
//!
//! A workflow is an ordered list of named steps. Each step carries an action
//! tag selecting an executor variant plus the optional payloads that variant
//! reads (request spec, response spec, poll query, conditions, render
//! settings). Definitions are parsed from YAML, validated once, and treated
//! as read-only for the lifetime of a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::QuerySpec;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: an ordered list of steps plus identity metadata.
///
/// The `id` is the key the runner resolves via its definition store; when a
/// definition is loaded from a file without an explicit `id`, the store fills
/// it in from the file stem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier used by `run_step(definition_id, ...)`.
    #[serde(default)]
    pub id: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps. The first step is the default entry point.
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The definition's entry step (first in the list), if any.
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work in a workflow.
///
/// Only the fields relevant to the step's `action` are read by the executor;
/// the rest are ignored. Validation rejects steps missing the fields their
/// action requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// User-defined step id (e.g. "create-payment"). Unique within a workflow.
    pub id: String,
    /// Executor variant. Defaults to `http_request` when absent.
    #[serde(default)]
    pub action: StepAction,
    /// Outgoing HTTP request (http_request, http_trigger, redirect).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSpec>,
    /// Response handling: field extraction and conditions (http_request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSpec>,
    /// Storage table to poll (poll_db).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Poll query; values may contain interpolation markers (poll_db).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QuerySpec>,
    /// Poll cadence in seconds (poll_db).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    /// Poll deadline in seconds (poll_db).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Step to chain into when the poll deadline passes without a match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
    /// Step-level conditions (http_trigger, poll_db).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Template name handed to the render backend (ui_form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Render backend key (ui_form). Defaults to the UI payload backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_type: Option<String>,
    /// Values (interpolated) merged into the run context before rendering
    /// (ui_form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, Value>>,
    /// Fall-through persistence write when no condition matches
    /// (http_trigger).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to_db: Option<SaveSpec>,
    /// Canned response used verbatim instead of dispatching over the network
    /// (http_request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_response: Option<Value>,
}

/// The executor variant a step selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Interpolate, dispatch, extract fields, run conditions, maybe chain.
    #[default]
    HttpRequest,
    /// Resolve an inbound body against the context and run conditions on it.
    HttpTrigger,
    /// Emit a redirect directive or an auto-submitting HTML form. Terminal.
    Redirect,
    /// Poll a storage table until a record matches or a deadline passes.
    PollDb,
    /// Merge context values and delegate to a render backend. Terminal.
    UiForm,
}

impl StepAction {
    /// Snake_case name as it appears in definitions (for logs and errors).
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::HttpRequest => "http_request",
            StepAction::HttpTrigger => "http_trigger",
            StepAction::Redirect => "redirect",
            StepAction::PollDb => "poll_db",
            StepAction::UiForm => "ui_form",
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// Outgoing HTTP request description. Url, header values, and every string
/// leaf of the body may contain `{{ }}` interpolation markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request body; `null` is treated as an empty object by the executor.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    /// Ordered body transforms applied after interpolation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<PluginSpec>>,
}

/// One entry in a request's plugin pipeline.
///
/// The `type` string keys the plugin registry; every other key is collected
/// into `options` and passed to the plugin untouched:
/// ```yaml
/// plugins:
///   - type: hmac_signature
///     secret_env: SIGNING_KEY
///     field: signature
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

/// How an http_request step consumes its response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseSpec {
    /// Values to lift out of the response tree into the run context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
    /// Branching rules evaluated against context merged with the response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// One response field extraction: either a bare source path (stored under its
/// last segment) or a `{target: path}` map renaming as it extracts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldSpec {
    Path(String),
    Renamed(BTreeMap<String, String>),
}

impl FieldSpec {
    /// (target key, source path) pairs this spec extracts.
    pub fn bindings(&self) -> Vec<(String, String)> {
        match self {
            FieldSpec::Path(path) => {
                let target = path.rsplit('.').next().unwrap_or(path).to_string();
                vec![(target, path.clone())]
            }
            FieldSpec::Renamed(map) => map
                .iter()
                .map(|(target, path)| (target.clone(), path.clone()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions and persistence writes
// ---------------------------------------------------------------------------

/// A (predicate, next-step, side-effect) triple.
///
/// Conditions are evaluated in list order and the first truthy `when` wins.
/// A condition without `when` never matches; it is inert, not an implicit
/// else branch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Condition {
    /// Bare boolean expression evaluated against the subject data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Step to chain into when this condition matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Persistence write executed only for the matched condition. Accepted
    /// under either key, `update_to_db` or `save_to_db`.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "save_to_db")]
    pub update_to_db: Option<SaveSpec>,
    /// Literal (interpolated) returned as the step outcome on match.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "return")]
    pub return_value: Option<Value>,
}

/// An upsert against a storage table.
///
/// `data` values are expressions resolved against the condition subject
/// before the write. `unique_keys` supplies the match criteria; when absent,
/// the full resolved data map is the match criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSpec {
    pub table: String,
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_keys: Option<BTreeMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
