//! Mutable key-value context threaded across the steps of a run.
//!
//! The store keeps two layers: the flat `values` map that steps merge into,
//! and the JSON tree of the most recent response. Lookups try the dotted
//! path against `values` first, then against the response tree, then fall
//! back to a depth-first search of the response tree for a key equal to the
//! whole lookup string. First match wins at every stage.

use serde_json::Value;

type JsonMap = serde_json::Map<String, Value>;

/// Per-run mutable context.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    values: JsonMap,
    last_response: Value,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run from caller-provided seed values.
    pub fn seeded(values: JsonMap) -> Self {
        Self {
            values,
            last_response: Value::Null,
        }
    }

    /// Shallow-merge an object into the store; incoming keys overwrite.
    pub fn merge(&mut self, incoming: &JsonMap) {
        for (key, value) in incoming {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Record the most recent upstream response tree.
    pub fn set_response(&mut self, response: Value) {
        self.last_response = response;
    }

    pub fn response(&self) -> &Value {
        &self.last_response
    }

    /// Flat view of the stored values, for interpolation contexts.
    pub fn snapshot(&self) -> &JsonMap {
        &self.values
    }

    /// Absorb the output of a completed step before chaining to the next:
    /// objects merge at the top level and become the new response tree,
    /// anything else only becomes the response tree.
    pub fn absorb_seed(&mut self, seed: Value) {
        if let Value::Object(map) = &seed {
            self.merge(map);
        }
        self.set_response(seed);
    }

    /// Tiered lookup described in the module docs. Returns `None` when no
    /// stage matches.
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(found) = lookup_path(&Value::Object(self.values.clone()), path) {
            return Some(found);
        }
        if let Some(found) = lookup_path(&self.last_response, path) {
            return Some(found);
        }
        deep_find(&self.last_response, path)
    }
}

/// Follow a dotted path through objects and (numeric-index) arrays.
fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Pre-order depth-first search for an exact key match anywhere in a tree.
/// At each object, local keys are checked before any child is descended
/// into, so the shallowest match in map iteration order wins.
fn deep_find(root: &Value, key: &str) -> Option<Value> {
    match root {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Some(found.clone());
            }
            map.values().find_map(|child| deep_find(child, key))
        }
        Value::Array(items) => items.iter().find_map(|item| deep_find(item, key)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> JsonMap {
        value.as_object().expect("test value is an object").clone()
    }

    #[test]
    fn test_merge_overwrites_existing_keys() {
        let mut store = ContextStore::seeded(object(json!({"a": 1, "b": 2})));
        store.merge(&object(json!({"b": 3, "c": 4})));
        assert_eq!(store.snapshot(), &object(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[test]
    fn test_get_prefers_values_over_response() {
        let mut store = ContextStore::seeded(object(json!({"status": "from_values"})));
        store.set_response(json!({"status": "from_response"}));
        assert_eq!(store.get("status"), Some(json!("from_values")));
    }

    #[test]
    fn test_get_dotted_path_into_response() {
        let mut store = ContextStore::new();
        store.set_response(json!({"data": {"order": {"id": 7}}}));
        assert_eq!(store.get("data.order.id"), Some(json!(7)));
    }

    #[test]
    fn test_get_dotted_path_through_array() {
        let mut store = ContextStore::new();
        store.set_response(json!({"items": [{"sku": "a"}, {"sku": "b"}]}));
        assert_eq!(store.get("items.1.sku"), Some(json!("b")));
    }

    #[test]
    fn test_get_falls_back_to_deep_search() {
        let mut store = ContextStore::new();
        store.set_response(json!({"data": {"attributes": {"payment_id": "pay_1"}}}));
        assert_eq!(store.get("payment_id"), Some(json!("pay_1")));
    }

    #[test]
    fn test_deep_search_checks_local_keys_before_descending() {
        // Key exists both at the top level and nested under "z"; the
        // top-level one is found first regardless of map order.
        let mut store = ContextStore::new();
        store.set_response(json!({"id": 2, "z": {"id": 1}}));
        assert_eq!(store.get("id"), Some(json!(2)));
    }

    #[test]
    fn test_deep_search_first_match_in_iteration_order_wins() {
        // Both matches are nested; siblings are visited in map iteration
        // order, so the one under "a" is reached before the one under "b".
        let mut store = ContextStore::new();
        store.set_response(json!({"a": {"id": 1}, "b": {"id": 9}}));
        assert_eq!(store.get("id"), Some(json!(1)));
    }

    #[test]
    fn test_deep_search_descends_into_arrays() {
        let mut store = ContextStore::new();
        store.set_response(json!({"rows": [{"inner": {"token": "t1"}}]}));
        assert_eq!(store.get("token"), Some(json!("t1")));
    }

    #[test]
    fn test_get_returns_none_when_nothing_matches() {
        let mut store = ContextStore::seeded(object(json!({"a": 1})));
        store.set_response(json!({"b": 2}));
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.get("a.b"), None);
    }

    #[test]
    fn test_absorb_seed_merges_objects_and_replaces_response() {
        let mut store = ContextStore::seeded(object(json!({"keep": true})));
        store.absorb_seed(json!({"order_id": "ord-1"}));
        assert_eq!(store.get("keep"), Some(json!(true)));
        assert_eq!(store.get("order_id"), Some(json!("ord-1")));
        assert_eq!(store.response(), &json!({"order_id": "ord-1"}));
    }

    #[test]
    fn test_absorb_seed_with_scalar_only_sets_response() {
        let mut store = ContextStore::seeded(object(json!({"keep": true})));
        store.absorb_seed(json!("plain"));
        assert_eq!(store.snapshot(), &object(json!({"keep": true})));
        assert_eq!(store.response(), &json!("plain"));
    }
}
