//! Persistence layer — libSQL-backed storage for inbox items and the records
//! routing produces.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
