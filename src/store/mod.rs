//! Persistence layer: libSQL-backed tasks, key-value space and job queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobQueue, KeyValueStore, TaskStore};
