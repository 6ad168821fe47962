//! Persistence layer: libSQL-backed queue and result storage.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlBackend;
