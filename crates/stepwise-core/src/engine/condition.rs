//! First-match condition resolution.
//!
//! A condition list is evaluated strictly in order against a subject object;
//! the first condition whose `when` predicate is truthy wins and later
//! predicates are never evaluated. A condition without a `when` never
//! matches -- an explicit `when: "true"` is required for a catch-all arm.

use serde_json::Value;
use stepwise_types::definition::{Condition, SaveSpec};

use crate::engine::evaluator::ExpressionEvaluator;

type JsonMap = serde_json::Map<String, Value>;

/// Find the first condition whose predicate is truthy for `subject`.
///
/// Evaluation is lazy: conditions after the winning one are not touched,
/// so their side-effecting expressions (route lookups, `env()` reads) never
/// run.
pub fn first_match<'a>(
    evaluator: &ExpressionEvaluator,
    conditions: &'a [Condition],
    subject: &JsonMap,
) -> Option<&'a Condition> {
    conditions.iter().find(|condition| match &condition.when {
        Some(predicate) => evaluator.evaluate_when(predicate, subject),
        None => false,
    })
}

/// Interpolate a save spec's maps against the run context.
///
/// Returns `(match_keys, data)`: the columns the upsert matches on and the
/// full row payload. When `unique_keys` is absent the whole data map doubles
/// as the match key set.
pub fn resolve_save_maps(
    evaluator: &ExpressionEvaluator,
    spec: &SaveSpec,
    ctx: &JsonMap,
) -> (JsonMap, JsonMap) {
    let data: JsonMap = spec
        .data
        .iter()
        .map(|(column, value)| (column.clone(), evaluator.interpolate_value(value, ctx)))
        .collect();
    let match_keys: JsonMap = match &spec.unique_keys {
        Some(keys) => keys
            .iter()
            .map(|(column, value)| (column.clone(), evaluator.interpolate_value(value, ctx)))
            .collect(),
        None => data.clone(),
    };
    (match_keys, data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
