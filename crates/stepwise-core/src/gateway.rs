//! Persistence gateway trait.
//!
//! The engine's only window onto storage: a generic query/upsert pair over
//! caller-owned tables. The trait is object-safe (boxed futures) so the
//! runner can hold it as `Arc<dyn PersistenceGateway>`; the SQLite
//! implementation lives in `stepwise-infra`.
//!
//! Failure policy: both operations surface errors so tests can assert on
//! them. The engine's default caller behavior is "log and continue" for
//! side-effect writes and "log, treat as no record" for poll queries.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use stepwise_types::error::GatewayError;
use stepwise_types::query::QuerySpec;

type JsonMap = serde_json::Map<String, Value>;

/// Generic query/upsert against arbitrary storage tables.
pub trait PersistenceGateway: Send + Sync {
    /// Find at most one record matching the query spec.
    fn query<'a>(
        &'a self,
        table: &'a str,
        spec: &'a QuerySpec,
    ) -> Pin<Box<dyn Future<Output = Result<Option<JsonMap>, GatewayError>> + Send + 'a>>;

    /// Atomically insert or update a row. `match_keys` are the columns the
    /// upsert matches on; `data` is the full row payload. The implementation
    /// must use the storage engine's native upsert, never read-then-write.
    fn upsert<'a>(
        &'a self,
        table: &'a str,
        match_keys: &'a JsonMap,
        data: &'a JsonMap,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;
}
