//! Request body plugin pipeline.
//!
//! Plugins transform an outbound request body immediately before dispatch,
//! in the exact order the step lists them. Each receives its own options
//! map, the body produced so far, and a read-only view of the run context.
//! An unknown plugin type aborts the step: a misconfigured pipeline must
//! never send a half-transformed request.

use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use stepwise_types::definition::PluginSpec;

use crate::engine::evaluator::ExpressionEvaluator;

type JsonMap = serde_json::Map<String, Value>;
type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown plugin type '{0}'")]
    UnknownType(String),

    #[error("plugin '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

// ---------------------------------------------------------------------------
// Plugin trait and registry
// ---------------------------------------------------------------------------

/// A named transformation applied to an outbound request body.
pub trait BodyPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Transform `body` using the plugin's `options`. The run context is
    /// read-only; plugins never write back into it.
    fn apply(&self, options: &JsonMap, body: Value, context: &JsonMap)
    -> Result<Value, PluginError>;
}

/// Registry of available plugins, keyed by the `type` field of a
/// [`PluginSpec`]. Custom plugins can be registered at runtime alongside
/// the built-ins.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn BodyPlugin>>,
}

impl PluginRegistry {
    /// Registry with the built-in plugins installed.
    pub fn with_builtins(evaluator: Arc<ExpressionEvaluator>) -> Self {
        let registry = Self::default();
        registry.register(Arc::new(SetFields { evaluator }));
        registry.register(Arc::new(HmacSignature));
        registry
    }

    pub fn register(&self, plugin: Arc<dyn BodyPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Run the pipeline in list order. The first failure aborts.
    pub fn apply_all(
        &self,
        specs: &[PluginSpec],
        mut body: Value,
        context: &JsonMap,
    ) -> Result<Value, PluginError> {
        for spec in specs {
            let plugin = self
                .plugins
                .get(&spec.kind)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| PluginError::UnknownType(spec.kind.clone()))?;
            tracing::debug!(plugin = %spec.kind, "applying request body plugin");
            body = plugin.apply(&spec.options, body, context)?;
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Built-in: set_fields
// ---------------------------------------------------------------------------

/// Sets or overwrites body fields. Every option value is interpolated
/// against the run context before assignment. A null body is promoted to
/// an empty object so a body can be built from scratch.
struct SetFields {
    evaluator: Arc<ExpressionEvaluator>,
}

impl BodyPlugin for SetFields {
    fn name(&self) -> &str {
        "set_fields"
    }

    fn apply(
        &self,
        options: &JsonMap,
        body: Value,
        context: &JsonMap,
    ) -> Result<Value, PluginError> {
        let mut map = match body {
            Value::Object(map) => map,
            Value::Null => JsonMap::new(),
            other => {
                return Err(PluginError::Failed {
                    name: self.name().to_string(),
                    reason: format!("body must be an object, got {}", value_kind(&other)),
                });
            }
        };
        for (field, value) in options {
            map.insert(field.clone(), self.evaluator.interpolate_value(value, context));
        }
        Ok(Value::Object(map))
    }
}

// ---------------------------------------------------------------------------
// Built-in: hmac_signature
// ---------------------------------------------------------------------------

/// Signs the body with HMAC-SHA256 and stores the hex digest in a field.
///
/// Options:
/// - `secret_env`: name of the environment variable holding the secret
/// - `secret`: inline secret, mainly for tests (takes effect only when
///   `secret_env` is absent)
/// - `field`: target field, default `"signature"`
///
/// The digest covers the canonical JSON of the body with the target field
/// removed, so re-signing an already signed body is stable.
struct HmacSignature;

impl BodyPlugin for HmacSignature {
    fn name(&self) -> &str {
        "hmac_signature"
    }

    fn apply(
        &self,
        options: &JsonMap,
        body: Value,
        _context: &JsonMap,
    ) -> Result<Value, PluginError> {
        let secret = self.resolve_secret(options)?;
        let field = options
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or("signature")
            .to_string();

        let mut map = match body {
            Value::Object(map) => map,
            other => {
                return Err(PluginError::Failed {
                    name: self.name().to_string(),
                    reason: format!("body must be an object, got {}", value_kind(&other)),
                });
            }
        };
        map.remove(&field);

        let payload = serde_json::to_string(&Value::Object(map.clone())).map_err(|err| {
            PluginError::Failed {
                name: self.name().to_string(),
                reason: err.to_string(),
            }
        })?;
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| PluginError::Failed {
                name: self.name().to_string(),
                reason: err.to_string(),
            })?;
        mac.update(payload.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());

        map.insert(field, Value::String(digest));
        Ok(Value::Object(map))
    }
}

impl HmacSignature {
    fn resolve_secret(&self, options: &JsonMap) -> Result<String, PluginError> {
        if let Some(var) = options.get("secret_env").and_then(Value::as_str) {
            return match std::env::var(var) {
                Ok(secret) if !secret.is_empty() => Ok(secret),
                _ => Err(PluginError::Failed {
                    name: self.name().to_string(),
                    reason: format!("environment variable '{var}' is not set"),
                }),
            };
        }
        if let Some(secret) = options.get("secret").and_then(Value::as_str) {
            return Ok(secret.to_string());
        }
        Err(PluginError::Failed {
            name: self.name().to_string(),
            reason: "neither 'secret_env' nor 'secret' option given".to_string(),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
