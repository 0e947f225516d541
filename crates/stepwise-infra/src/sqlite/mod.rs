//! SQLite persistence: split reader/writer pool and the generic gateway.

pub mod gateway;
pub mod pool;

pub use gateway::SqliteGateway;
pub use pool::DatabasePool;
