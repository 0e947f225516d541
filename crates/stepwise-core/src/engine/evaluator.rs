//! Expression evaluator for `when` predicates and `{{ }}` interpolation.
//!
//! Wraps a `minijinja::Environment` with the engine's built-in functions
//! pre-registered and provides the two evaluation surfaces the executor
//! needs: typed evaluation of bare expressions and recursive interpolation
//! of `{{ }}` markers inside arbitrary JSON trees.
//!
//! Failure policy: the public surface never raises. An expression that does
//! not resolve degrades to the original, un-evaluated text (interpolation)
//! or to "no match" (`when` predicates). `try_evaluate` exposes the
//! distinguishable outcome so callers and tests can tell "evaluated to null"
//! from "evaluation failed".
//!
//! **Security note:** context data is always passed as the template context,
//! NEVER spliced into expression source strings.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use minijinja::value::Rest;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value as TemplateValue};
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;

type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Route resolver hook
// ---------------------------------------------------------------------------

/// Collaborator hook backing the `route(name, params?)` built-in.
pub trait RouteResolver: Send + Sync {
    /// Resolve a named route and optional params into a URL.
    fn resolve(&self, name: &str, params: &Value) -> Option<String>;
}

/// Name-to-URL-template route table.
///
/// Templates may contain `{param}` placeholders filled from the params
/// object: `"https://pay.example.com/checkout/{order_id}"`.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: HashMap<String, String>,
}

impl StaticRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.routes.insert(name.into(), template.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.routes.insert(name.into(), template.into());
    }
}

impl RouteResolver for StaticRoutes {
    fn resolve(&self, name: &str, params: &Value) -> Option<String> {
        let mut url = self.routes.get(name)?.clone();
        if let Value::Object(map) = params {
            for (key, value) in map {
                url = url.replace(&format!("{{{key}}}"), &scalar_to_string(value));
            }
        }
        Some(url)
    }
}

/// Render a scalar the way it should appear inside a URL or concat output.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Evaluation outcome
// ---------------------------------------------------------------------------

/// Distinguishable result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// The expression produced a value (possibly null).
    Resolved(Value),
    /// Parse or runtime failure; the reason is kept for logs and tests.
    Unresolved { reason: String },
}

impl EvalOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, EvalOutcome::Resolved(_))
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// minijinja-backed evaluator with the engine built-ins registered.
///
/// Used for:
/// - `when` predicate evaluation (bare expressions, JS-like truthiness)
/// - `{{ }}` interpolation in request bodies, urls, headers, save specs
/// - typed whole-marker resolution (`"{{ amount * 1.1 }}"` stays numeric)
pub struct ExpressionEvaluator {
    env: Environment<'static>,
}

impl ExpressionEvaluator {
    /// Create an evaluator with no named routes registered; `route(...)`
    /// calls will degrade.
    pub fn new() -> Self {
        Self::with_routes(Arc::new(StaticRoutes::new()))
    }

    /// Create an evaluator backed by the given route resolver.
    pub fn with_routes(routes: Arc<dyn RouteResolver>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("env", |name: String| -> String {
            std::env::var(&name).unwrap_or_default()
        });
        env.add_function("now", || -> String { chrono::Utc::now().to_rfc3339() });
        env.add_function("uuid", || -> String { uuid::Uuid::new_v4().to_string() });
        env.add_function("base64", |value: String| -> String {
            BASE64.encode(value.as_bytes())
        });
        env.add_function("random_hex", |len: Option<i64>| -> String {
            let len = len.unwrap_or(32).clamp(0, 1024) as usize;
            let mut bytes = vec![0u8; len.div_ceil(2)];
            OsRng.fill_bytes(&mut bytes);
            let mut out = hex::encode(bytes);
            out.truncate(len);
            out
        });

        env.add_function("upper", |s: String| -> String { s.to_uppercase() });
        env.add_function("lower", |s: String| -> String { s.to_lowercase() });
        env.add_function("substr", |s: String, start: i64, len: Option<i64>| -> String {
            let chars: Vec<char> = s.chars().collect();
            let from = if start < 0 {
                chars.len().saturating_sub(start.unsigned_abs() as usize)
            } else {
                (start as usize).min(chars.len())
            };
            let take = match len {
                Some(l) if l < 0 => 0,
                Some(l) => l as usize,
                None => chars.len() - from,
            };
            chars[from..].iter().take(take).collect()
        });
        env.add_function("concat", |parts: Rest<TemplateValue>| -> String {
            parts.iter().map(|v| v.to_string()).collect()
        });

        env.add_function("round", |n: f64, digits: Option<i64>| -> f64 {
            match digits {
                Some(d) => {
                    let factor = 10f64.powi(d as i32);
                    (n * factor).round() / factor
                }
                None => n.round(),
            }
        });
        env.add_function("ceil", |n: f64| -> f64 { n.ceil() });
        env.add_function("floor", |n: f64| -> f64 { n.floor() });
        env.add_function("abs", |n: f64| -> f64 { n.abs() });

        let resolver = routes.clone();
        env.add_function(
            "route",
            move |name: String, params: Option<TemplateValue>| -> Result<TemplateValue, minijinja::Error> {
                let params = params
                    .map(|p| serde_json::to_value(&p).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                match resolver.resolve(&name, &params) {
                    Some(url) => Ok(TemplateValue::from(url)),
                    None => Err(minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("unknown route '{name}'"),
                    )),
                }
            },
        );

        Self { env }
    }

    // -----------------------------------------------------------------------
    // Bare expression evaluation
    // -----------------------------------------------------------------------

    /// Evaluate a bare expression to a typed JSON value, reporting failure
    /// as a distinguishable outcome instead of raising.
    pub fn try_evaluate(&self, expr: &str, ctx: &JsonMap) -> EvalOutcome {
        let compiled = match self.env.compile_expression(expr) {
            Ok(compiled) => compiled,
            Err(err) => {
                return EvalOutcome::Unresolved {
                    reason: err.to_string(),
                };
            }
        };
        match compiled.eval(TemplateValue::from_serialize(ctx)) {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(json) => EvalOutcome::Resolved(json),
                Err(err) => EvalOutcome::Unresolved {
                    reason: err.to_string(),
                },
            },
            Err(err) => EvalOutcome::Unresolved {
                reason: err.to_string(),
            },
        }
    }

    /// Evaluate a bare expression; on failure, return the original text.
    pub fn evaluate(&self, expr: &str, ctx: &JsonMap) -> Value {
        match self.try_evaluate(expr, ctx) {
            EvalOutcome::Resolved(value) => value,
            EvalOutcome::Unresolved { reason } => {
                tracing::warn!(expr, %reason, "expression unresolved, returning original text");
                Value::String(expr.to_string())
            }
        }
    }

    /// Evaluate a `when` predicate with JS-like truthiness. An unresolved
    /// predicate never matches.
    pub fn evaluate_when(&self, expr: &str, subject: &JsonMap) -> bool {
        match self.try_evaluate(expr, subject) {
            EvalOutcome::Resolved(value) => value_truthy(&value),
            EvalOutcome::Unresolved { reason } => {
                tracing::warn!(expr, %reason, "when predicate unresolved, treating as no match");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interpolation
    // -----------------------------------------------------------------------

    /// Resolve `{{ }}` markers in one string.
    ///
    /// A string that is a single marker resolves to the expression's typed
    /// value; mixed text renders to a string. On failure the original input
    /// is returned unchanged.
    pub fn interpolate_str(&self, input: &str, ctx: &JsonMap) -> Value {
        if !input.contains("{{") {
            return Value::String(input.to_string());
        }
        if let Some(expr) = single_marker(input.trim()) {
            return match self.try_evaluate(expr, ctx) {
                EvalOutcome::Resolved(value) => value,
                EvalOutcome::Unresolved { reason } => {
                    tracing::warn!(input, %reason, "interpolation unresolved, keeping original");
                    Value::String(input.to_string())
                }
            };
        }
        match self
            .env
            .render_str(input, TemplateValue::from_serialize(ctx))
        {
            Ok(rendered) => Value::String(rendered),
            Err(err) => {
                tracing::warn!(input, reason = %err, "interpolation unresolved, keeping original");
                Value::String(input.to_string())
            }
        }
    }

    /// Walk a JSON tree and resolve every string leaf.
    pub fn interpolate_value(&self, value: &Value, ctx: &JsonMap) -> Value {
        match value {
            Value::String(s) => self.interpolate_str(s, ctx),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate_value(item, ctx))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(self.interpolate_map(map, ctx)),
            other => other.clone(),
        }
    }

    /// Interpolate every value of a JSON object (keys stay as written).
    pub fn interpolate_map(&self, map: &JsonMap, ctx: &JsonMap) -> JsonMap {
        map.iter()
            .map(|(key, value)| (key.clone(), self.interpolate_value(value, ctx)))
            .collect()
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// If the whole (trimmed) string is one `{{ expr }}` marker, return the
/// inner expression.
fn single_marker(input: &str) -> Option<&str> {
    let inner = input.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
