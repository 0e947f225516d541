//! Generic SQLite persistence gateway.
//!
//! Implements the engine's query/upsert contract against caller-owned
//! tables. Table and column names come from workflow definitions, so they
//! are validated as bare identifiers before being spliced into SQL; all
//! values go through bind parameters. Upserts use SQLite's native
//! `INSERT ... ON CONFLICT ... DO UPDATE`, never read-then-write, so
//! concurrent writers stay atomic.

use std::future::Future;
use std::pin::Pin;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo};
use stepwise_core::gateway::PersistenceGateway;
use stepwise_types::error::GatewayError;
use stepwise_types::query::{QueryClause, QuerySpec};

use super::pool::DatabasePool;

type JsonMap = serde_json::Map<String, Value>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Comparison operators accepted in `{operator, value}` clauses.
const OPERATORS: &[&str] = &["=", "!=", "<>", "<", "<=", ">", ">=", "LIKE"];

/// SQLite-backed [`PersistenceGateway`].
#[derive(Clone)]
pub struct SqliteGateway {
    pool: DatabasePool,
}

impl SqliteGateway {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn do_query(
        &self,
        table: &str,
        spec: &QuerySpec,
    ) -> Result<Option<JsonMap>, GatewayError> {
        validate_identifier(table)?;

        let mut binds: Vec<Value> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        for (column, clause) in spec.iter() {
            validate_identifier(column)?;
            clauses.push(clause_sql(column, clause, &mut binds)?);
        }

        let sql = if clauses.is_empty() {
            format!("SELECT * FROM {table} LIMIT 1")
        } else {
            format!("SELECT * FROM {table} WHERE {} LIMIT 1", clauses.join(" AND "))
        };

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|err| GatewayError::Query(err.to_string()))?;

        row.map(|row| row_to_map(&row)).transpose()
    }

    async fn do_upsert(
        &self,
        table: &str,
        match_keys: &JsonMap,
        data: &JsonMap,
    ) -> Result<(), GatewayError> {
        validate_identifier(table)?;
        if match_keys.is_empty() {
            return Err(GatewayError::Write(
                "upsert requires at least one match key".to_string(),
            ));
        }

        // Full row payload: data, plus any match key it does not carry.
        let mut row = data.clone();
        for (column, value) in match_keys {
            if !row.contains_key(column) {
                row.insert(column.clone(), value.clone());
            }
        }
        for column in row.keys() {
            validate_identifier(column)?;
        }

        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let conflict: Vec<&str> = match_keys.keys().map(String::as_str).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|column| !match_keys.contains_key(**column))
            .map(|column| format!("{column} = excluded.{column}"))
            .collect();

        let sql = if updates.is_empty() {
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT({}) DO NOTHING",
                columns.join(", "),
                conflict.join(", "),
            )
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT({}) DO UPDATE SET {}",
                columns.join(", "),
                conflict.join(", "),
                updates.join(", "),
            )
        };

        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        query
            .execute(&self.pool.writer)
            .await
            .map_err(|err| GatewayError::Write(err.to_string()))?;
        Ok(())
    }
}

impl PersistenceGateway for SqliteGateway {
    fn query<'a>(
        &'a self,
        table: &'a str,
        spec: &'a QuerySpec,
    ) -> Pin<Box<dyn Future<Output = Result<Option<JsonMap>, GatewayError>> + Send + 'a>> {
        Box::pin(self.do_query(table, spec))
    }

    fn upsert<'a>(
        &'a self,
        table: &'a str,
        match_keys: &'a JsonMap,
        data: &'a JsonMap,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(self.do_upsert(table, match_keys, data))
    }
}

// ---------------------------------------------------------------------------
// SQL generation
// ---------------------------------------------------------------------------

/// A bare SQL identifier: leading letter or underscore, then letters,
/// digits, underscores. Anything else is rejected before reaching SQL text.
fn validate_identifier(name: &str) -> Result<(), GatewayError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidIdentifier(name.to_string()))
    }
}

fn normalize_operator(operator: &str) -> Result<String, GatewayError> {
    let upper = operator.trim().to_uppercase();
    if OPERATORS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(GatewayError::Query(format!("unsupported operator '{operator}'")))
    }
}

/// Render one clause to SQL, pushing its bind values in order.
fn clause_sql(
    column: &str,
    clause: &QueryClause,
    binds: &mut Vec<Value>,
) -> Result<String, GatewayError> {
    match clause {
        QueryClause::Eq(value) => {
            binds.push(value.clone());
            Ok(format!("{column} = ?"))
        }
        QueryClause::Compare { operator, value } => {
            let operator = normalize_operator(operator)?;
            binds.push(value.clone());
            Ok(format!("{column} {operator} ?"))
        }
        QueryClause::In { values } => {
            if values.is_empty() {
                return Ok("1 = 0".to_string());
            }
            binds.extend(values.iter().cloned());
            let placeholders = vec!["?"; values.len()].join(", ");
            Ok(format!("{column} IN ({placeholders})"))
        }
        QueryClause::NotIn { not_in } => {
            if not_in.is_empty() {
                return Ok("1 = 1".to_string());
            }
            binds.extend(not_in.iter().cloned());
            let placeholders = vec!["?"; not_in.len()].join(", ");
            Ok(format!("{column} NOT IN ({placeholders})"))
        }
        QueryClause::Or { or } => {
            if or.is_empty() {
                return Ok("1 = 0".to_string());
            }
            let parts = or
                .iter()
                .map(|sub| clause_sql(column, sub, binds))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(text) => query.bind(text.clone()),
        // Arrays/objects are stored as their JSON text.
        other => query.bind(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Decode a row into JSON by declared column type. BLOBs come back as
/// base64 text.
fn row_to_map(row: &SqliteRow) -> Result<JsonMap, GatewayError> {
    let mut map = JsonMap::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name())
            .map_err(|err| GatewayError::Decode(format!("column '{}': {err}", column.name())))?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn decode_column(row: &SqliteRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "INTEGER" | "NUMERIC" => row
            .try_get::<Option<i64>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<Option<f64>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Option<Vec<u8>>, _>(index)?
            .map(|bytes| Value::String(BASE64.encode(bytes)))
            .unwrap_or(Value::Null),
        // TEXT, DATETIME, and anything else declared: read as text.
        _ => row
            .try_get::<Option<String>, _>(index)?
            .map(Value::from)
            .unwrap_or(Value::Null),
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
