//! Step execution: one handler per action kind.
//!
//! The executor resolves a step's inputs against the run context, performs
//! the step's side effects through the collaborator traits, and reports
//! either a terminal outcome or a chain continuation for the runner's
//! trampoline to follow.
//!
//! `redirect` and `ui_form` are always terminal. `http_request`,
//! `http_trigger` and `poll_db` chain when a matched condition (or
//! `on_timeout`) names a next step.

use std::sync::Arc;
use std::time::Duration;

use minijinja::{Environment, context};
use serde_json::{Value, json};
use stepwise_types::definition::{Condition, RequestSpec, SaveSpec, Step, StepAction};
use stepwise_types::query::{QueryClause, QuerySpec};
use tokio_util::sync::CancellationToken;

use crate::engine::condition::{first_match, resolve_save_maps};
use crate::engine::context::ContextStore;
use crate::engine::definition::DefinitionError;
use crate::engine::evaluator::ExpressionEvaluator;
use crate::engine::plugin::{PluginError, PluginRegistry};
use crate::engine::runner::EngineConfig;
use crate::gateway::PersistenceGateway;
use crate::http::{HttpDispatcher, HttpError, HttpRequest};
use crate::render::{RenderError, RenderRegistry, RenderedView};

type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal engine errors. Everything here aborts the run; recoverable
/// situations (unresolved expressions, persistence write failures, poll
/// timeouts) are handled in place and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step}' is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },

    #[error("chain depth {depth} exceeds maximum {max}")]
    ChainDepthExceeded { depth: u32, max: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("http dispatch failed: {0}")]
    Http(#[from] HttpError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal payload of a step (and therefore of the run that ends on it).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Plain JSON result: a response, resolved body, record, or a matched
    /// condition's `return` literal.
    Value(Value),
    /// Redirect directive (GET redirect step).
    Redirect { url: String },
    /// Auto-submitting HTML form (non-GET redirect step).
    Form { html: String },
    /// Rendered view from a `ui_form` step.
    View(RenderedView),
}

impl StepOutcome {
    /// JSON representation for observer events and CLI output.
    pub fn to_value(&self) -> Value {
        match self {
            StepOutcome::Value(value) => value.clone(),
            StepOutcome::Redirect { url } => json!({"redirect": url}),
            StepOutcome::Form { html } => json!({"form": html}),
            StepOutcome::View(RenderedView::Payload(payload)) => payload.clone(),
            StepOutcome::View(RenderedView::Document(doc)) => json!({"document": doc}),
        }
    }
}

/// What the runner does after a step: stop, or follow the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum StepProgress {
    Done(StepOutcome),
    /// Chain into `next`, seeding the context with the step's output.
    Continue { next: String, seed: Value },
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching on their action kind.
pub struct StepExecutor {
    evaluator: Arc<ExpressionEvaluator>,
    plugins: Arc<PluginRegistry>,
    renders: Arc<RenderRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
    http: Arc<dyn HttpDispatcher>,
    default_poll_interval: Duration,
    default_poll_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        evaluator: Arc<ExpressionEvaluator>,
        plugins: Arc<PluginRegistry>,
        renders: Arc<RenderRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
        http: Arc<dyn HttpDispatcher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            evaluator,
            plugins,
            renders,
            gateway,
            http,
            default_poll_interval: Duration::from_secs(config.default_poll_interval_secs),
            default_poll_timeout: Duration::from_secs(config.default_poll_timeout_secs),
        }
    }

    /// Execute one step against the run context.
    pub async fn execute(
        &self,
        step: &Step,
        ctx: &mut ContextStore,
        cancel: &CancellationToken,
    ) -> Result<StepProgress, EngineError> {
        match step.action {
            StepAction::HttpRequest => self.run_http_request(step, ctx).await,
            StepAction::HttpTrigger => self.run_http_trigger(step, ctx).await,
            StepAction::Redirect => self.run_redirect(step, ctx),
            StepAction::PollDb => self.run_poll_db(step, ctx, cancel).await,
            StepAction::UiForm => self.run_ui_form(step, ctx),
        }
    }

    // -----------------------------------------------------------------------
    // http_request
    // -----------------------------------------------------------------------

    async fn run_http_request(
        &self,
        step: &Step,
        ctx: &mut ContextStore,
    ) -> Result<StepProgress, EngineError> {
        let response = match &step.mock_response {
            // Canned response short-circuits interpolation, plugins, and the
            // network alike.
            Some(mock) => mock.clone(),
            None => {
                let spec = step.request.as_ref().ok_or_else(|| missing(step, "request"))?;
                let request = self.prepare_request(spec, ctx.snapshot())?;
                tracing::debug!(
                    step = %step.id,
                    method = %request.method,
                    url = %request.url,
                    "dispatching http request"
                );
                self.http.dispatch(&request).await?
            }
        };
        ctx.set_response(response.clone());

        if let Some(spec) = &step.response {
            // Lift requested fields into the context via the two-tier lookup.
            let mut extracted = JsonMap::new();
            for field in &spec.fields {
                for (target, path) in field.bindings() {
                    if let Some(value) = ctx.get(&path) {
                        extracted.insert(target, value);
                    } else {
                        tracing::warn!(step = %step.id, path, "response field not found");
                    }
                }
            }
            ctx.merge(&extracted);

            // Conditions see context merged with the raw response; response
            // keys win on collision.
            let mut subject = ctx.snapshot().clone();
            if let Value::Object(map) = &response {
                for (key, value) in map {
                    subject.insert(key.clone(), value.clone());
                }
            }

            if let Some(condition) = first_match(&self.evaluator, &spec.conditions, &subject) {
                self.apply_side_effect(condition, &subject).await;
                if let Some(next) = &condition.next {
                    return Ok(StepProgress::Continue {
                        next: next.clone(),
                        seed: response,
                    });
                }
                if let Some(literal) = &condition.return_value {
                    return Ok(StepProgress::Done(StepOutcome::Value(
                        self.evaluator.interpolate_value(literal, &subject),
                    )));
                }
            }
        }

        Ok(StepProgress::Done(StepOutcome::Value(response)))
    }

    /// Interpolate url/headers/body and run the plugin pipeline.
    fn prepare_request(
        &self,
        spec: &RequestSpec,
        snapshot: &JsonMap,
    ) -> Result<HttpRequest, EngineError> {
        let mut body = self.evaluator.interpolate_value(&spec.body, snapshot);
        if let Some(plugins) = &spec.plugins {
            body = self.plugins.apply_all(plugins, body, snapshot)?;
        }
        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), self.interpolate_to_string(value, snapshot)))
            .collect();
        Ok(HttpRequest {
            method: spec.method.clone(),
            url: self.interpolate_to_string(&spec.url, snapshot),
            headers,
            body,
        })
    }

    // -----------------------------------------------------------------------
    // http_trigger
    // -----------------------------------------------------------------------

    async fn run_http_trigger(
        &self,
        step: &Step,
        ctx: &mut ContextStore,
    ) -> Result<StepProgress, EngineError> {
        let spec = step.request.as_ref().ok_or_else(|| missing(step, "request"))?;
        let fields = spec.body.as_object().cloned().unwrap_or_default();
        let snapshot = ctx.snapshot().clone();

        // A string field with markers is an expression; a bare string is a
        // context path; everything else is walked for embedded markers.
        let mut resolved = JsonMap::new();
        for (key, value) in &fields {
            let resolved_value = match value {
                Value::String(text) if text.contains("{{") => {
                    self.evaluator.interpolate_str(text, &snapshot)
                }
                Value::String(path) => ctx.get(path).unwrap_or(Value::Null),
                other => self.evaluator.interpolate_value(other, &snapshot),
            };
            resolved.insert(key.clone(), resolved_value);
        }

        // Conditions see only the resolved body, never the wider context.
        if let Some(condition) = first_match(&self.evaluator, &step.conditions, &resolved) {
            self.apply_side_effect(condition, &resolved).await;
            if let Some(next) = &condition.next {
                return Ok(StepProgress::Continue {
                    next: next.clone(),
                    seed: Value::Object(resolved),
                });
            }
            if let Some(literal) = &condition.return_value {
                return Ok(StepProgress::Done(StepOutcome::Value(
                    self.evaluator.interpolate_value(literal, &resolved),
                )));
            }
            return Ok(StepProgress::Done(StepOutcome::Value(Value::Object(resolved))));
        }

        // No match: fall through to the step-level write, then the body.
        if let Some(save) = &step.save_to_db {
            self.run_save(save, &resolved).await;
        }
        Ok(StepProgress::Done(StepOutcome::Value(Value::Object(resolved))))
    }

    // -----------------------------------------------------------------------
    // redirect
    // -----------------------------------------------------------------------

    fn run_redirect(&self, step: &Step, ctx: &ContextStore) -> Result<StepProgress, EngineError> {
        let spec = step.request.as_ref().ok_or_else(|| missing(step, "request"))?;
        let snapshot = ctx.snapshot();

        let mut body = self.evaluator.interpolate_value(&spec.body, snapshot);
        if let Some(plugins) = &spec.plugins {
            body = self.plugins.apply_all(plugins, body, snapshot)?;
        }
        let fields = body.as_object().cloned().unwrap_or_default();
        let url = self.interpolate_to_string(&spec.url, snapshot);

        if spec.method.eq_ignore_ascii_case("GET") {
            let query: Vec<String> = fields
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(&scalar_string(value))
                    )
                })
                .collect();
            let url = if query.is_empty() {
                url
            } else if url.contains('?') {
                format!("{url}&{}", query.join("&"))
            } else {
                format!("{url}?{}", query.join("&"))
            };
            Ok(StepProgress::Done(StepOutcome::Redirect { url }))
        } else {
            let html = render_auto_submit_form(&url, &spec.method, &fields)?;
            Ok(StepProgress::Done(StepOutcome::Form { html }))
        }
    }

    // -----------------------------------------------------------------------
    // poll_db
    // -----------------------------------------------------------------------

    async fn run_poll_db(
        &self,
        step: &Step,
        ctx: &mut ContextStore,
        cancel: &CancellationToken,
    ) -> Result<StepProgress, EngineError> {
        let table = step.table.as_ref().ok_or_else(|| missing(step, "table"))?;
        let spec = step.query.as_ref().ok_or_else(|| missing(step, "query"))?;
        let query = self.interpolate_query(spec, ctx.snapshot());

        let interval = step
            .interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_poll_interval);
        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_poll_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // A failed tick is "no record yet", not a run failure.
            let record = match self.gateway.query(table, &query).await {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(step = %step.id, table = %table, error = %err, "poll query failed");
                    None
                }
            };

            if let Some(record) = record {
                ctx.set_response(Value::Object(record.clone()));
                if let Some(condition) = first_match(&self.evaluator, &step.conditions, &record) {
                    self.apply_side_effect(condition, &record).await;
                    if let Some(next) = &condition.next {
                        return Ok(StepProgress::Continue {
                            next: next.clone(),
                            seed: Value::Object(record),
                        });
                    }
                    if let Some(literal) = &condition.return_value {
                        return Ok(StepProgress::Done(StepOutcome::Value(
                            self.evaluator.interpolate_value(literal, &record),
                        )));
                    }
                }
                return Ok(StepProgress::Done(StepOutcome::Value(Value::Object(record))));
            }

            // Biased so the deadline wins over an interval tick that lands
            // at the same instant.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(step = %step.id, table = %table, "poll timed out without a match");
                    return match &step.on_timeout {
                        Some(next) => Ok(StepProgress::Continue {
                            next: next.clone(),
                            seed: Value::Object(JsonMap::new()),
                        }),
                        None => Ok(StepProgress::Done(StepOutcome::Value(Value::Object(
                            JsonMap::new(),
                        )))),
                    };
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Resolve interpolation markers inside every clause value.
    fn interpolate_query(&self, spec: &QuerySpec, snapshot: &JsonMap) -> QuerySpec {
        QuerySpec(
            spec.iter()
                .map(|(field, clause)| (field.clone(), self.interpolate_clause(clause, snapshot)))
                .collect(),
        )
    }

    fn interpolate_clause(&self, clause: &QueryClause, snapshot: &JsonMap) -> QueryClause {
        match clause {
            QueryClause::Eq(value) => QueryClause::Eq(self.evaluator.interpolate_value(value, snapshot)),
            QueryClause::Compare { operator, value } => QueryClause::Compare {
                operator: operator.clone(),
                value: self.evaluator.interpolate_value(value, snapshot),
            },
            QueryClause::In { values } => QueryClause::In {
                values: values
                    .iter()
                    .map(|value| self.evaluator.interpolate_value(value, snapshot))
                    .collect(),
            },
            QueryClause::NotIn { not_in } => QueryClause::NotIn {
                not_in: not_in
                    .iter()
                    .map(|value| self.evaluator.interpolate_value(value, snapshot))
                    .collect(),
            },
            QueryClause::Or { or } => QueryClause::Or {
                or: or
                    .iter()
                    .map(|sub| self.interpolate_clause(sub, snapshot))
                    .collect(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // ui_form
    // -----------------------------------------------------------------------

    fn run_ui_form(&self, step: &Step, ctx: &mut ContextStore) -> Result<StepProgress, EngineError> {
        if let Some(extra) = &step.context {
            let snapshot = ctx.snapshot().clone();
            let merged = self.evaluator.interpolate_map(extra, &snapshot);
            ctx.merge(&merged);
        }
        let template = step.template.as_ref().ok_or_else(|| missing(step, "template"))?;
        let view = self
            .renders
            .render(step.render_type.as_deref(), template, ctx.snapshot())?;
        Ok(StepProgress::Done(StepOutcome::View(view)))
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Run a matched condition's persistence write. Failures are logged and
    /// swallowed: the run's progress never depends on audit writes.
    async fn apply_side_effect(&self, condition: &Condition, subject: &JsonMap) {
        if let Some(spec) = &condition.update_to_db {
            self.run_save(spec, subject).await;
        }
    }

    async fn run_save(&self, spec: &SaveSpec, subject: &JsonMap) {
        let (match_keys, data) = resolve_save_maps(&self.evaluator, spec, subject);
        if let Err(err) = self.gateway.upsert(&spec.table, &match_keys, &data).await {
            tracing::warn!(table = %spec.table, error = %err, "persistence write failed, continuing");
        }
    }

    fn interpolate_to_string(&self, input: &str, snapshot: &JsonMap) -> String {
        scalar_string(&self.evaluator.interpolate_str(input, snapshot))
    }
}

fn missing(step: &Step, field: &'static str) -> EngineError {
    EngineError::MissingField {
        step: step.id.clone(),
        field,
    }
}

/// Render a JSON value as it should appear in a URL or form field.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Auto-submitting form rendering
// ---------------------------------------------------------------------------

const AUTO_SUBMIT_FORM: &str = r#"<!DOCTYPE html>
<html>
<body onload="document.forms[0].submit()">
<form action="{{ url }}" method="{{ method }}">
{%- for field in fields %}
<input type="hidden" name="{{ field.name }}" value="{{ field.value }}">
{%- endfor %}
</form>
</body>
</html>
"#;

/// Build the auto-submit document for non-GET redirects. Registered under an
/// `.html` name so minijinja escapes every interpolated value.
fn render_auto_submit_form(
    url: &str,
    method: &str,
    fields: &JsonMap,
) -> Result<String, RenderError> {
    let mut env = Environment::new();
    env.add_template("redirect_form.html", AUTO_SUBMIT_FORM)
        .map_err(|err| RenderError::Render(err.to_string()))?;
    let fields: Vec<Value> = fields
        .iter()
        .map(|(name, value)| json!({"name": name, "value": scalar_string(value)}))
        .collect();
    env.get_template("redirect_form.html")
        .map_err(|err| RenderError::Render(err.to_string()))?
        .render(context! { url, method, fields })
        .map_err(|err| RenderError::Render(err.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use stepwise_types::definition::{FieldSpec, PluginSpec, ResponseSpec};
    use stepwise_types::error::GatewayError;

    fn object(value: Value) -> JsonMap {
        value.as_object().expect("test value is an object").clone()
    }

    // -- Mock collaborators --------------------------------------------------

    /// Gateway that records upserts and answers queries from a scripted list
    /// (one entry per tick; `None` means "no record yet").
    #[derive(Default)]
    struct MockGateway {
        query_results: Mutex<Vec<Option<JsonMap>>>,
        queries: Mutex<Vec<(String, QuerySpec)>>,
        upserts: Mutex<Vec<(String, JsonMap, JsonMap)>>,
        fail_upserts: bool,
    }

    impl MockGateway {
        fn scripted(results: Vec<Option<JsonMap>>) -> Self {
            Self {
                query_results: Mutex::new(results),
                ..Self::default()
            }
        }
    }

    impl PersistenceGateway for MockGateway {
        fn query<'a>(
            &'a self,
            table: &'a str,
            spec: &'a QuerySpec,
        ) -> Pin<Box<dyn Future<Output = Result<Option<JsonMap>, GatewayError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.queries
                    .lock()
                    .unwrap()
                    .push((table.to_string(), spec.clone()));
                let mut results = self.query_results.lock().unwrap();
                if results.is_empty() {
                    Ok(None)
                } else {
                    Ok(results.remove(0))
                }
            })
        }

        fn upsert<'a>(
            &'a self,
            table: &'a str,
            match_keys: &'a JsonMap,
            data: &'a JsonMap,
        ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail_upserts {
                    return Err(GatewayError::Write("disk full".to_string()));
                }
                self.upserts.lock().unwrap().push((
                    table.to_string(),
                    match_keys.clone(),
                    data.clone(),
                ));
                Ok(())
            })
        }
    }

    /// Dispatcher that records the request and returns a canned response.
    struct MockHttp {
        response: Value,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockHttp {
        fn returning(response: Value) -> Self {
            Self {
                response,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpDispatcher for MockHttp {
        fn dispatch<'a>(
            &'a self,
            request: &'a HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<Value, HttpError>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                Ok(self.response.clone())
            })
        }
    }

    // -- Harness -------------------------------------------------------------

    struct Harness {
        executor: StepExecutor,
        gateway: Arc<MockGateway>,
        http: Arc<MockHttp>,
    }

    fn harness_with(gateway: MockGateway, http: MockHttp) -> Harness {
        let evaluator = Arc::new(ExpressionEvaluator::new());
        let gateway = Arc::new(gateway);
        let http = Arc::new(http);
        let executor = StepExecutor::new(
            evaluator.clone(),
            Arc::new(PluginRegistry::with_builtins(evaluator)),
            Arc::new(RenderRegistry::with_builtins()),
            gateway.clone(),
            http.clone(),
            &EngineConfig::default(),
        );
        Harness {
            executor,
            gateway,
            http,
        }
    }

    fn harness() -> Harness {
        harness_with(MockGateway::default(), MockHttp::returning(json!({})))
    }

    fn step(id: &str, action: StepAction) -> Step {
        Step {
            id: id.to_string(),
            action,
            request: None,
            response: None,
            table: None,
            query: None,
            interval_seconds: None,
            timeout_seconds: None,
            on_timeout: None,
            conditions: vec![],
            template: None,
            render_type: None,
            context: None,
            save_to_db: None,
            mock_response: None,
        }
    }

    fn request(method: &str, url: &str, body: Value) -> RequestSpec {
        RequestSpec {
            url: url.to_string(),
            method: method.to_string(),
            headers: BTreeMap::new(),
            body,
            plugins: None,
        }
    }

    async fn execute(harness: &Harness, step: &Step, ctx: &mut ContextStore) -> StepProgress {
        harness
            .executor
            .execute(step, ctx, &CancellationToken::new())
            .await
            .expect("step succeeds")
    }

    // -------------------------------------------------------------------
    // http_request
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_http_request_interpolates_and_dispatches() {
        let h = harness_with(
            MockGateway::default(),
            MockHttp::returning(json!({"status": "ok"})),
        );
        let mut s = step("pay", StepAction::HttpRequest);
        let mut spec = request(
            "POST",
            "https://api.example.com/orders/{{ order_id }}",
            json!({"amount": "{{ amount }}"}),
        );
        spec.headers
            .insert("X-Order".to_string(), "{{ order_id }}".to_string());
        s.request = Some(spec);

        let mut ctx = ContextStore::seeded(object(json!({"order_id": "ord-1", "amount": 100})));
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"status": "ok"})))
        );

        let requests = h.http.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://api.example.com/orders/ord-1");
        assert_eq!(requests[0].headers.get("X-Order"), Some(&"ord-1".to_string()));
        assert_eq!(requests[0].body, json!({"amount": 100}));
    }

    #[tokio::test]
    async fn test_http_request_mock_response_bypasses_network() {
        let h = harness();
        let mut s = step("pay", StepAction::HttpRequest);
        s.mock_response = Some(json!({"payment_id": "pay_1"}));

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"payment_id": "pay_1"})))
        );
        assert!(h.http.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_request_extracts_fields_with_deep_fallback() {
        let h = harness();
        let mut s = step("pay", StepAction::HttpRequest);
        s.mock_response = Some(json!({"data": {"attributes": {"payment_id": "pay_1"}}}));
        s.response = Some(ResponseSpec {
            fields: vec![
                FieldSpec::Path("data.attributes.payment_id".to_string()),
                FieldSpec::Renamed(BTreeMap::from([(
                    "pid".to_string(),
                    // Not a valid path; found by the deep fallback.
                    "payment_id".to_string(),
                )])),
            ],
            conditions: vec![],
        });

        let mut ctx = ContextStore::new();
        execute(&h, &s, &mut ctx).await;
        assert_eq!(ctx.get("payment_id"), Some(json!("pay_1")));
        assert_eq!(ctx.get("pid"), Some(json!("pay_1")));
    }

    #[tokio::test]
    async fn test_http_request_condition_chains_and_saves() {
        let h = harness();
        let mut s = step("pay", StepAction::HttpRequest);
        s.mock_response = Some(json!({"status": "pending", "payment_id": "pay_1"}));
        s.response = Some(ResponseSpec {
            fields: vec![],
            conditions: vec![Condition {
                when: Some("status == 'pending'".to_string()),
                next: Some("await".to_string()),
                update_to_db: Some(SaveSpec {
                    table: "payments".to_string(),
                    data: BTreeMap::from([
                        ("payment_id".to_string(), json!("{{ payment_id }}")),
                        ("status".to_string(), json!("pending")),
                    ]),
                    unique_keys: Some(BTreeMap::from([(
                        "payment_id".to_string(),
                        json!("{{ payment_id }}"),
                    )])),
                }),
                return_value: None,
            }],
        });

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Continue {
                next: "await".to_string(),
                seed: json!({"status": "pending", "payment_id": "pay_1"}),
            }
        );

        let upserts = h.gateway.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].0, "payments");
        assert_eq!(upserts[0].1, object(json!({"payment_id": "pay_1"})));
        assert_eq!(
            upserts[0].2,
            object(json!({"payment_id": "pay_1", "status": "pending"}))
        );
    }

    #[tokio::test]
    async fn test_http_request_return_literal_is_interpolated() {
        let h = harness();
        let mut s = step("pay", StepAction::HttpRequest);
        s.mock_response = Some(json!({"status": "failed", "code": 42}));
        s.response = Some(ResponseSpec {
            fields: vec![],
            conditions: vec![Condition {
                when: Some("status == 'failed'".to_string()),
                next: None,
                update_to_db: None,
                return_value: Some(json!({"error": "code-{{ code }}"})),
            }],
        });

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"error": "code-42"})))
        );
    }

    #[tokio::test]
    async fn test_http_request_upsert_failure_does_not_abort() {
        let mut gateway = MockGateway::default();
        gateway.fail_upserts = true;
        let h = harness_with(gateway, MockHttp::returning(json!({})));

        let mut s = step("pay", StepAction::HttpRequest);
        s.mock_response = Some(json!({"status": "ok"}));
        s.response = Some(ResponseSpec {
            fields: vec![],
            conditions: vec![Condition {
                when: Some("status == 'ok'".to_string()),
                next: None,
                update_to_db: Some(SaveSpec {
                    table: "audit".to_string(),
                    data: BTreeMap::from([("status".to_string(), json!("ok"))]),
                    unique_keys: None,
                }),
                return_value: None,
            }],
        });

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"status": "ok"})))
        );
    }

    #[tokio::test]
    async fn test_http_request_unknown_plugin_is_fatal() {
        let h = harness();
        let mut s = step("pay", StepAction::HttpRequest);
        let mut spec = request("POST", "https://api.example.com", json!({}));
        spec.plugins = Some(vec![PluginSpec {
            kind: "no_such_plugin".to_string(),
            options: JsonMap::new(),
        }]);
        s.request = Some(spec);

        let mut ctx = ContextStore::new();
        let err = h
            .executor
            .execute(&s, &mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Plugin(PluginError::UnknownType(_))));
    }

    // -------------------------------------------------------------------
    // http_trigger
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_http_trigger_resolves_expressions_and_paths() {
        let h = harness();
        let mut s = step("trigger", StepAction::HttpTrigger);
        s.request = Some(request(
            "POST",
            "https://unused.example.com",
            json!({
                "amount": "{{ amount * 1.1 }}",
                "payment": "data.payment_id",
                "fixed": 7,
            }),
        ));

        let mut ctx = ContextStore::seeded(object(json!({"amount": 100})));
        ctx.set_response(json!({"data": {"payment_id": "pay_1"}}));

        let progress = execute(&h, &s, &mut ctx).await;
        let StepProgress::Done(StepOutcome::Value(body)) = progress else {
            panic!("expected terminal value");
        };
        let amount = body["amount"].as_f64().expect("numeric amount");
        assert!((amount - 110.0).abs() < 1e-9);
        assert_eq!(body["payment"], json!("pay_1"));
        assert_eq!(body["fixed"], json!(7));
    }

    #[tokio::test]
    async fn test_http_trigger_path_miss_resolves_to_null() {
        let h = harness();
        let mut s = step("trigger", StepAction::HttpTrigger);
        s.request = Some(request("POST", "https://unused", json!({"gone": "no.such.path"})));

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"gone": null})))
        );
    }

    #[tokio::test]
    async fn test_http_trigger_conditions_see_only_the_body() {
        let h = harness();
        let mut s = step("trigger", StepAction::HttpTrigger);
        s.request = Some(request("POST", "https://unused", json!({"amount": "{{ amount }}"})));
        // `secret` exists in the context but not in the resolved body, so the
        // predicate must not see it.
        s.conditions = vec![Condition {
            when: Some("secret == 'open sesame'".to_string()),
            next: Some("vault".to_string()),
            ..Condition::default()
        }];

        let mut ctx =
            ContextStore::seeded(object(json!({"amount": 5, "secret": "open sesame"})));
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"amount": 5})))
        );
    }

    #[tokio::test]
    async fn test_http_trigger_no_match_falls_through_to_save() {
        let h = harness();
        let mut s = step("trigger", StepAction::HttpTrigger);
        s.request = Some(request("POST", "https://unused", json!({"status": "{{ status }}"})));
        s.conditions = vec![Condition {
            when: Some("status == 'failed'".to_string()),
            next: Some("other".to_string()),
            ..Condition::default()
        }];
        s.save_to_db = Some(SaveSpec {
            table: "triggers".to_string(),
            data: BTreeMap::from([("status".to_string(), json!("{{ status }}"))]),
            unique_keys: None,
        });

        let mut ctx = ContextStore::seeded(object(json!({"status": "ok"})));
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({"status": "ok"})))
        );
        let upserts = h.gateway.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].0, "triggers");
        assert_eq!(upserts[0].2, object(json!({"status": "ok"})));
    }

    #[tokio::test]
    async fn test_http_trigger_matched_condition_chains_with_body_seed() {
        let h = harness();
        let mut s = step("trigger", StepAction::HttpTrigger);
        s.request = Some(request("POST", "https://unused", json!({"status": "{{ status }}"})));
        s.conditions = vec![Condition {
            when: Some("status == 'paid'".to_string()),
            next: Some("fulfil".to_string()),
            ..Condition::default()
        }];

        let mut ctx = ContextStore::seeded(object(json!({"status": "paid"})));
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Continue {
                next: "fulfil".to_string(),
                seed: json!({"status": "paid"}),
            }
        );
    }

    // -------------------------------------------------------------------
    // redirect
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_redirect_get_appends_query_string() {
        let h = harness();
        let mut s = step("go", StepAction::Redirect);
        s.request = Some(request(
            "GET",
            "https://pay.example.com/checkout",
            json!({"order": "{{ order_id }}", "note": "a b&c"}),
        ));

        let mut ctx = ContextStore::seeded(object(json!({"order_id": "ord 1"})));
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Redirect {
                url: "https://pay.example.com/checkout?note=a%20b%26c&order=ord%201".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_redirect_get_extends_existing_query() {
        let h = harness();
        let mut s = step("go", StepAction::Redirect);
        s.request = Some(request(
            "GET",
            "https://pay.example.com/checkout?v=1",
            json!({"order": "ord-1"}),
        ));

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Redirect {
                url: "https://pay.example.com/checkout?v=1&order=ord-1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_redirect_post_emits_escaped_form() {
        let h = harness();
        let mut s = step("go", StepAction::Redirect);
        s.request = Some(request(
            "POST",
            "https://pay.example.com/submit",
            json!({"note": "<script>alert(1)</script>"}),
        ));

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        let StepProgress::Done(StepOutcome::Form { html }) = progress else {
            panic!("expected form outcome");
        };
        assert!(html.contains(r#"action="https:&#x2f;&#x2f;pay.example.com&#x2f;submit""#));
        assert!(html.contains(r#"method="POST""#));
        assert!(html.contains("name=\"note\""));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("document.forms[0].submit()"));
    }

    // -------------------------------------------------------------------
    // poll_db
    // -------------------------------------------------------------------

    fn poll_step(interval: u64, timeout: u64) -> Step {
        let mut s = step("await", StepAction::PollDb);
        s.table = Some("orders".to_string());
        s.query = Some(QuerySpec(BTreeMap::from([(
            "status".to_string(),
            QueryClause::Eq(json!("paid")),
        )])));
        s.interval_seconds = Some(interval);
        s.timeout_seconds = Some(timeout);
        s
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_returns_record_after_retries() {
        let h = harness_with(
            MockGateway::scripted(vec![
                None,
                None,
                Some(object(json!({"status": "paid", "order_id": "ord-1"}))),
            ]),
            MockHttp::returning(json!({})),
        );

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &poll_step(1, 10), &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Done(StepOutcome::Value(json!({
                "status": "paid",
                "order_id": "ord-1",
            })))
        );
        assert_eq!(h.gateway.queries.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_timeout_chains_into_on_timeout_once() {
        let h = harness_with(
            MockGateway::scripted(vec![]),
            MockHttp::returning(json!({})),
        );
        let mut s = poll_step(1, 3);
        s.on_timeout = Some("notify_failure".to_string());

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Continue {
                next: "notify_failure".to_string(),
                seed: json!({}),
            }
        );
        // interval 1s, timeout 3s: ticks at 0s, 1s, 2s, then the deadline.
        assert_eq!(h.gateway.queries.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_timeout_without_on_timeout_returns_empty_record() {
        let h = harness_with(
            MockGateway::scripted(vec![]),
            MockHttp::returning(json!({})),
        );

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &poll_step(1, 2), &mut ctx).await;
        assert_eq!(progress, StepProgress::Done(StepOutcome::Value(json!({}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_cancellation_aborts_the_wait() {
        let h = harness_with(
            MockGateway::scripted(vec![]),
            MockHttp::returning(json!({})),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut ctx = ContextStore::new();
        let err = h
            .executor
            .execute(&poll_step(1, 60), &mut ctx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_matched_condition_chains_with_record_seed() {
        let h = harness_with(
            MockGateway::scripted(vec![Some(object(json!({"status": "paid"})))]),
            MockHttp::returning(json!({})),
        );
        let mut s = poll_step(1, 10);
        s.conditions = vec![Condition {
            when: Some("status == 'paid'".to_string()),
            next: Some("fulfil".to_string()),
            ..Condition::default()
        }];

        let mut ctx = ContextStore::new();
        let progress = execute(&h, &s, &mut ctx).await;
        assert_eq!(
            progress,
            StepProgress::Continue {
                next: "fulfil".to_string(),
                seed: json!({"status": "paid"}),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_db_interpolates_query_values() {
        let h = harness_with(
            MockGateway::scripted(vec![Some(object(json!({"ok": true})))]),
            MockHttp::returning(json!({})),
        );
        let mut s = poll_step(1, 10);
        s.query = Some(QuerySpec(BTreeMap::from([(
            "order_id".to_string(),
            QueryClause::Eq(json!("{{ order_id }}")),
        )])));

        let mut ctx = ContextStore::seeded(object(json!({"order_id": "ord-1"})));
        execute(&h, &s, &mut ctx).await;
        let queries = h.gateway.queries.lock().unwrap();
        assert_eq!(
            queries[0].1.0.get("order_id"),
            Some(&QueryClause::Eq(json!("ord-1")))
        );
    }

    // -------------------------------------------------------------------
    // ui_form
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_ui_form_merges_context_and_renders_payload() {
        let h = harness();
        let mut s = step("show", StepAction::UiForm);
        s.template = Some("receipt".to_string());
        s.context = Some(object(json!({"title": "Receipt for {{ payment_id }}"})));

        let mut ctx = ContextStore::seeded(object(json!({"payment_id": "pay_1"})));
        let progress = execute(&h, &s, &mut ctx).await;
        let StepProgress::Done(StepOutcome::View(RenderedView::Payload(payload))) = progress
        else {
            panic!("expected payload view");
        };
        assert_eq!(payload["template"], json!("receipt"));
        assert_eq!(payload["context"]["title"], json!("Receipt for pay_1"));
        assert_eq!(ctx.get("title"), Some(json!("Receipt for pay_1")));
    }

    #[tokio::test]
    async fn test_ui_form_unknown_render_type_is_fatal() {
        let h = harness();
        let mut s = step("show", StepAction::UiForm);
        s.template = Some("receipt".to_string());
        s.render_type = Some("hologram".to_string());

        let mut ctx = ContextStore::new();
        let err = h
            .executor
            .execute(&s, &mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Render(RenderError::UnknownBackend(_))
        ));
    }
}
