//! Poll query types.
//!
//! A `QuerySpec` is the storage-agnostic query shape a `poll_db` step hands
//! to the persistence gateway: a map of field name to clause. Clauses cover
//! the shapes definitions use in the wild -- bare literals, explicit
//! operator/value pairs, set membership, and per-field `or` groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field-to-clause query map. Keys iterate in sorted order so generated SQL
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySpec(pub BTreeMap<String, QueryClause>);

impl QuerySpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QueryClause)> {
        self.0.iter()
    }
}

/// One clause applied to a single field.
///
/// Untagged: variants are tried in declaration order, so the structured
/// shapes (`or`, `in`, `not_in`, `operator`/`value`) win over the bare
/// literal fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryClause {
    /// `{or: [...]}` -- the field matches if any sub-clause matches.
    Or { or: Vec<QueryClause> },
    /// `{in: [...]}` -- set membership.
    In {
        #[serde(rename = "in")]
        values: Vec<Value>,
    },
    /// `{not_in: [...]}` -- negated set membership.
    NotIn { not_in: Vec<Value> },
    /// `{operator: ">=", value: 100}` -- explicit comparison.
    Compare { operator: String, value: Value },
    /// Bare literal, compared with equality.
    Eq(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_clause_parses_as_eq() {
        let spec: QuerySpec = serde_yaml_ng::from_str("status: paid").expect("parse");
        assert_eq!(spec.0.get("status"), Some(&QueryClause::Eq(json!("paid"))));
    }

    #[test]
    fn test_operator_clause() {
        let yaml = r#"
amount:
  operator: ">="
  value: 100
"#;
        let spec: QuerySpec = serde_yaml_ng::from_str(yaml).expect("parse");
        assert_eq!(
            spec.0.get("amount"),
            Some(&QueryClause::Compare {
                operator: ">=".to_string(),
                value: json!(100),
            })
        );
    }

    #[test]
    fn test_in_and_not_in_clauses() {
        let yaml = r#"
status:
  in: [paid, settled]
channel:
  not_in: [test]
"#;
        let spec: QuerySpec = serde_yaml_ng::from_str(yaml).expect("parse");
        assert_eq!(
            spec.0.get("status"),
            Some(&QueryClause::In {
                values: vec![json!("paid"), json!("settled")],
            })
        );
        assert_eq!(
            spec.0.get("channel"),
            Some(&QueryClause::NotIn {
                not_in: vec![json!("test")],
            })
        );
    }

    #[test]
    fn test_or_group_of_clauses() {
        let yaml = r#"
status:
  or:
    - paid
    - operator: "="
      value: settled
"#;
        let spec: QuerySpec = serde_yaml_ng::from_str(yaml).expect("parse");
        match spec.0.get("status") {
            Some(QueryClause::Or { or }) => {
                assert_eq!(or.len(), 2);
                assert_eq!(or[0], QueryClause::Eq(json!("paid")));
                assert!(matches!(or[1], QueryClause::Compare { .. }));
            }
            other => panic!("expected or group, got {other:?}"),
        }
    }

    #[test]
    fn test_interpolated_value_survives_roundtrip() {
        let spec: QuerySpec =
            serde_yaml_ng::from_str("order_id: '{{ order_id }}'").expect("parse");
        let yaml = serde_yaml_ng::to_string(&spec).expect("serialize");
        let back: QuerySpec = serde_yaml_ng::from_str(&yaml).expect("reparse");
        assert_eq!(spec, back);
    }
}
