//! Infrastructure implementations of the Stepwise collaborator traits.
//!
//! - `sqlite` -- persistence gateway over sqlx (WAL reader/writer pool pair)
//! - `http` -- HTTP dispatcher over reqwest
//! - `fs` -- directory-of-YAML definition store

pub mod fs;
pub mod http;
pub mod sqlite;
